//! 核心数据模型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{PilotError, Result};

/// 门户账户
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub nickname: String,                       // 全局唯一
    pub username: String,
    pub credential_blob: String,                // 由 SecretsVault 加密的凭据
    pub push_topic: Option<String>,             // 外部推送频道
    pub signature_template: Option<Signature>,  // 默认签名笔迹
    pub notifications_enabled: bool,
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// 是否应当注册外部推送
    pub fn push_channel(&self) -> Option<&str> {
        if !self.notifications_enabled {
            return None;
        }
        self.push_topic.as_deref().filter(|topic| !topic.trim().is_empty())
    }
}

/// 新建账户请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAccount {
    pub nickname: String,
    pub username: String,
    pub credential_blob: String,
    pub push_topic: Option<String>,
    pub signature_template: Option<Signature>,
    pub notifications_enabled: bool,
}

/// 登录凭据（已解密）
#[derive(Clone)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// 患者信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Patient {
    pub patient_key: String,        // 门户内部患者标识
    pub name: String,
    pub location: Option<String>,
    pub visits: Vec<Visit>,
    pub last_updated: DateTime<Utc>,
}

/// 门户患者列表中的一行
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientRecord {
    pub patient_key: String,
    pub name: String,
    pub dob: Option<String>,
    pub address: Option<String>,
    pub phone: Option<String>,
    pub status: Option<String>,
}

impl PatientRecord {
    /// 转换为待持久化的患者快照
    pub fn into_patient(self, now: DateTime<Utc>) -> Patient {
        Patient {
            patient_key: self.patient_key,
            name: self.name,
            location: None,
            visits: Vec::new(),
            last_updated: now,
        }
    }
}

/// 访视记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Visit {
    pub visit_id: String,
    pub date: String,
    pub status: VisitStatus,
}

impl Visit {
    /// 是否可签名，始终由状态推导
    pub fn signable(&self) -> bool {
        self.status == VisitStatus::Unsigned
    }
}

/// 访视状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisitStatus {
    Unsigned,
    Signed,
    Other,
}

impl VisitStatus {
    /// 根据门户显示的状态文本解析
    pub fn from_label(label: &str) -> Self {
        let label = label.trim().to_lowercase();
        if label.contains("unsigned") {
            VisitStatus::Unsigned
        } else if label.contains("signed") {
            VisitStatus::Signed
        } else {
            VisitStatus::Other
        }
    }
}

/// 任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Sign,
    Autofill,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Sign => "sign",
            TaskType::Autofill => "autofill",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 任务状态，只有 `Scheduled` 不是终态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TaskStatus::Scheduled)
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = PilotError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "scheduled" => Ok(TaskStatus::Scheduled),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            other => Err(PilotError::Validation(format!("unknown task status: {}", other))),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 坐标点，序列化为 `[x, y]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point(pub f64, pub f64);

impl Point {
    pub fn x(&self) -> f64 {
        self.0
    }

    pub fn y(&self) -> f64 {
        self.1
    }
}

/// 一笔：从落笔到抬笔的连续坐标
pub type Stroke = Vec<Point>;

/// 手写签名
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Signature {
    pub strokes: Vec<Stroke>,
}

impl Signature {
    pub fn new(strokes: Vec<Stroke>) -> Self {
        Self { strokes }
    }

    /// 非空笔画数
    pub fn stroke_count(&self) -> usize {
        self.strokes.iter().filter(|stroke| !stroke.is_empty()).count()
    }

    pub fn is_blank(&self) -> bool {
        self.stroke_count() == 0
    }
}

/// 签名方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignMethod {
    DrawSignature,
    PatientUnable,
}

/// 表单字段值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Flag(bool),
    Number(f64),
    Text(String),
}

impl FieldValue {
    /// 文本形式，用于输入框和下拉框
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Flag(flag) => flag.to_string(),
            FieldValue::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => format!("{}", *n as i64),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Text(text) => text.clone(),
        }
    }

    /// 布尔形式，用于复选框
    pub fn as_flag(&self) -> bool {
        match self {
            FieldValue::Flag(flag) => *flag,
            FieldValue::Number(n) => *n != 0.0,
            FieldValue::Text(text) => matches!(
                text.trim().to_lowercase().as_str(),
                "true" | "yes" | "on" | "1" | "checked"
            ),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Flag(value)
    }
}

/// 单个表单字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteField {
    pub name: String,
    pub value: FieldValue,
}

impl NoteField {
    pub fn new(name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// 字段名会被拼接进选择器，只允许安全字符
pub fn validate_field_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(PilotError::Validation(format!("invalid field name: {:?}", name)))
    }
}

/// 签名任务载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignPayload {
    pub visit_id: String,
    pub method: SignMethod,
    #[serde(default)]
    pub signature: Option<Signature>,
}

/// 自动填写任务载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutofillPayload {
    pub visit_id: String,
    pub fields: Vec<NoteField>,
}

/// 按任务类型区分的载荷
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "task_type", content = "payload", rename_all = "snake_case")]
pub enum TaskPayload {
    Sign(SignPayload),
    Autofill(AutofillPayload),
}

impl TaskPayload {
    pub fn task_type(&self) -> TaskType {
        match self {
            TaskPayload::Sign(_) => TaskType::Sign,
            TaskPayload::Autofill(_) => TaskType::Autofill,
        }
    }

    pub fn visit_id(&self) -> &str {
        match self {
            TaskPayload::Sign(payload) => &payload.visit_id,
            TaskPayload::Autofill(payload) => &payload.visit_id,
        }
    }

    /// 调度时校验，格式错误的载荷在这里失败
    pub fn validate(&self) -> Result<()> {
        if self.visit_id().trim().is_empty() {
            return Err(PilotError::Validation("visit_id is required".to_string()));
        }

        match self {
            TaskPayload::Sign(payload) => {
                if payload.method == SignMethod::DrawSignature {
                    let drawable = payload
                        .signature
                        .as_ref()
                        .map(|signature| !signature.is_blank())
                        .unwrap_or(false);
                    if !drawable {
                        return Err(PilotError::Validation(
                            "draw_signature requires a non-empty signature".to_string(),
                        ));
                    }
                }
            }
            TaskPayload::Autofill(payload) => {
                if payload.fields.is_empty() {
                    return Err(PilotError::Validation(
                        "autofill requires at least one field".to_string(),
                    ));
                }
                for field in &payload.fields {
                    validate_field_name(&field.name)?;
                }
            }
        }

        Ok(())
    }
}

/// 计划任务
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: Uuid,
    pub patient_key: String,
    pub run_at: DateTime<Utc>,
    pub status: TaskStatus,
    #[serde(flatten)]
    pub payload: TaskPayload,
    pub created_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

impl ScheduledTask {
    /// 创建并校验新任务
    pub fn new(patient_key: impl Into<String>, run_at: DateTime<Utc>, payload: TaskPayload) -> Result<Self> {
        let patient_key = patient_key.into();
        if patient_key.trim().is_empty() {
            return Err(PilotError::Validation("patient_key is required".to_string()));
        }
        payload.validate()?;

        Ok(Self {
            task_id: Uuid::new_v4(),
            patient_key,
            run_at,
            status: TaskStatus::Scheduled,
            payload,
            created_at: Utc::now(),
            last_error: None,
        })
    }

    pub fn task_type(&self) -> TaskType {
        self.payload.task_type()
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Scheduled && self.run_at <= now
    }
}

/// 通知级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Default for Severity {
    fn default() -> Self {
        Severity::Warning
    }
}

/// 通知可见范围
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationScope {
    User(String),
    Broadcast,
}

/// 通知
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    scope: NotificationScope,
}

impl Notification {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        scope: NotificationScope,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
            scope,
        }
    }

    /// 创建后不可修改
    pub fn scope(&self) -> &NotificationScope {
        &self.scope
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self.scope, NotificationScope::Broadcast)
    }

    pub fn belongs_to(&self, user_id: &str) -> bool {
        matches!(&self.scope, NotificationScope::User(owner) if owner == user_id)
    }

    /// 用户可见：自己的通知加上所有广播
    pub fn is_visible_to(&self, user_id: &str) -> bool {
        self.is_broadcast() || self.belongs_to(user_id)
    }
}
