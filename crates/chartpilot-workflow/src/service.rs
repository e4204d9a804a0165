//! 自动化服务
//!
//! 对外操作的统一入口。门户相关的失败在这里被记录并作为结果值返回，
//! 只有存储错误通过 `Err` 向上传播。

use std::sync::Arc;

use chartpilot_core::{
    validate_field_name, Account, Credential, NewAccount, NoteField, PilotError, Result, ScheduledTask, SecretsVault,
    Severity, Signature, TaskPayload, TaskStatus, Visit,
};
use chartpilot_database::TaskStore;
use chartpilot_integration::{LiveEvent, NotificationManager, TaskNotifier, SYSTEM_USER};
use chartpilot_portal::{ConnectionState, PortalHandle};
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::scheduler::{run_exclusive, TaskRun};
use crate::state_machine::{TaskEvent, TaskStateMachine};

/// 每个完成任务折算节省的小时数
const HOURS_SAVED_PER_TASK: f64 = 0.25;

/// 操作结果，序列化为 `{success, error?}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            error: Some(error.to_string()),
        }
    }
}

/// 患者抓取结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub success: bool,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchOutcome {
    fn failed(error: impl std::fmt::Display) -> Self {
        Self {
            success: false,
            count: 0,
            error: Some(error.to_string()),
        }
    }
}

/// 访视抓取结果
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VisitsOutcome {
    pub success: bool,
    pub visits: Vec<Visit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 控制面板统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DashboardStats {
    /// 今天待执行的任务
    pub tasks_today: usize,
    /// 本周（周一起）待执行的任务
    pub tasks_week: usize,
    pub total_patients: usize,
    pub completed_tasks: usize,
    /// 成功率（百分比，一位小数），没有执行过的任务时为 100
    pub success_rate: f64,
    pub time_saved_hours: f64,
    pub browser_connected: bool,
}

/// 浏览器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BrowserStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub authenticated: bool,
}

/// 新建账户请求，密码以明文传入并在存储前加密
#[derive(Clone, Deserialize)]
pub struct AccountRequest {
    pub nickname: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub push_topic: Option<String>,
    #[serde(default)]
    pub signature_template: Option<Signature>,
    #[serde(default = "default_notifications_enabled")]
    pub notifications_enabled: bool,
}

fn default_notifications_enabled() -> bool {
    true
}

impl std::fmt::Debug for AccountRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountRequest")
            .field("nickname", &self.nickname)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("push_topic", &self.push_topic)
            .finish()
    }
}

/// 自动化服务
pub struct AutomationService {
    store: Arc<dyn TaskStore>,
    vault: Arc<dyn SecretsVault>,
    portal: PortalHandle,
    notifications: Arc<NotificationManager>,
    notifier: TaskNotifier,
    state_machine: TaskStateMachine,
}

impl std::fmt::Debug for AutomationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutomationService").finish_non_exhaustive()
    }
}

impl AutomationService {
    pub fn new(
        store: Arc<dyn TaskStore>,
        vault: Arc<dyn SecretsVault>,
        portal: PortalHandle,
        notifications: Arc<NotificationManager>,
    ) -> Self {
        Self {
            store,
            vault,
            portal,
            notifier: TaskNotifier::new(notifications.clone()),
            notifications,
            state_machine: TaskStateMachine::new(),
        }
    }

    // ========== 账户 ==========

    /// 创建账户，凭据加密后存储，启用通知时注册推送频道
    pub async fn create_account(&self, request: AccountRequest) -> Result<Account> {
        if request.nickname.trim().is_empty() || request.username.trim().is_empty() {
            return Err(PilotError::Validation("nickname and username are required".to_string()));
        }
        if request.password.is_empty() {
            return Err(PilotError::Validation("password is required".to_string()));
        }

        let credential_blob = self.vault.encrypt(&request.password)?;
        let account = self
            .store
            .insert_account(NewAccount {
                nickname: request.nickname.trim().to_string(),
                username: request.username,
                credential_blob,
                push_topic: request.push_topic,
                signature_template: request.signature_template,
                notifications_enabled: request.notifications_enabled,
            })
            .await?;

        if let Some(topic) = account.push_channel() {
            self.notifications
                .register_push_topic(&account.id.to_string(), topic)
                .await;
        }
        info!("Account {} created", account.nickname);
        Ok(account)
    }

    pub async fn list_accounts(&self) -> Result<Vec<Account>> {
        self.store.list_accounts().await
    }

    // ========== 任务 ==========

    /// 校验载荷后保存新任务
    pub async fn schedule_task(
        &self,
        patient_key: &str,
        run_at: DateTime<Utc>,
        payload: TaskPayload,
    ) -> Result<ScheduledTask> {
        let task = ScheduledTask::new(patient_key, run_at, payload)?;
        self.store.insert_task(&task).await?;

        info!(
            "Task {} ({}) scheduled for patient {} at {}",
            task.task_id,
            task.task_type(),
            task.patient_key,
            task.run_at
        );
        self.notifier
            .notify_scheduled(SYSTEM_USER, &task.patient_key, task.task_type(), task.run_at)
            .await;
        Ok(task)
    }

    pub async fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<ScheduledTask>> {
        self.store.list_tasks(status).await
    }

    /// 取消尚未执行的任务；已执行或已被调度器取走的任务返回 `false`
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool> {
        let task = self.require_task(task_id).await?;
        let target = self.state_machine.transition(task.status, TaskEvent::Cancelled)?;

        let applied = self
            .store
            .transition_task(task_id, TaskStatus::Scheduled, target, None)
            .await?;
        if applied {
            info!("Task {} cancelled", task_id);
        }
        Ok(applied)
    }

    /// 立即执行任务，不等待调度
    pub async fn execute_now(&self, task_id: Uuid) -> Result<OperationOutcome> {
        let task = self.require_task(task_id).await?;
        self.state_machine.transition(task.status, TaskEvent::Succeeded)?;

        let run = run_exclusive(
            self.store.as_ref(),
            &self.portal,
            &self.state_machine,
            &self.notifications,
            &self.notifier,
            task_id,
        )
        .await?;

        Ok(match run {
            TaskRun::Skipped(Some(status)) => OperationOutcome::failed(format!("task is already {}", status)),
            TaskRun::Skipped(None) => OperationOutcome::failed(format!("task {} not found", task_id)),
            TaskRun::Finished { status: None, .. } => OperationOutcome::failed("task was cancelled during execution"),
            TaskRun::Finished { error: Some(error), .. } => OperationOutcome::failed(error),
            TaskRun::Finished { error: None, .. } => OperationOutcome::ok(),
        })
    }

    async fn require_task(&self, task_id: Uuid) -> Result<ScheduledTask> {
        self.store
            .get_task(task_id)
            .await?
            .ok_or_else(|| PilotError::NotFound(format!("task {}", task_id)))
    }

    // ========== 患者 ==========

    /// 使用账户凭据登录门户并同步患者列表
    pub async fn fetch_patients(&self, account_id: Uuid) -> Result<FetchOutcome> {
        let account = match self.store.get_account(account_id).await? {
            Some(account) => account,
            None => return Ok(FetchOutcome::failed(format!("account {} not found", account_id))),
        };
        let password = match self.vault.decrypt(&account.credential_blob) {
            Ok(password) => password,
            Err(e) => {
                warn!("Failed to decrypt credential for account {}: {}", account.nickname, e);
                return Ok(FetchOutcome::failed(e));
            }
        };
        let credential = Credential {
            username: account.username.clone(),
            password,
        };

        let records = {
            let mut session = self.portal.lock().await;
            if !session.is_connected() {
                return Ok(FetchOutcome::failed("browser not connected"));
            }
            if let Err(e) = session.login(&credential).await {
                return Ok(FetchOutcome::failed(e));
            }
            match session.fetch_patients().await {
                Ok(records) => records,
                Err(e) => return Ok(FetchOutcome::failed(e)),
            }
        };

        let now = Utc::now();
        let count = records.len();
        for record in records {
            self.store.upsert_patient(&record.into_patient(now)).await?;
        }

        info!("Fetched {} patients for account {}", count, account.nickname);
        self.notifications
            .broadcast(
                "Patients Fetched",
                &format!("Successfully fetched {} patients from portal", count),
                Severity::Success,
            )
            .await;

        Ok(FetchOutcome {
            success: true,
            count,
            error: None,
        })
    }

    /// 读取并保存患者的访视快照
    pub async fn fetch_visits(&self, patient_key: &str) -> Result<VisitsOutcome> {
        let result = {
            let mut session = self.portal.lock().await;
            if session.is_connected() {
                session.fetch_visits(patient_key).await
            } else {
                Err(PilotError::ConnectionLost("browser not connected".to_string()))
            }
        };

        match result {
            Ok(visits) => {
                if !self.store.update_patient_visits(patient_key, &visits).await? {
                    warn!("Patient {} is not stored, visits were not saved", patient_key);
                }
                Ok(VisitsOutcome {
                    success: true,
                    visits,
                    error: None,
                })
            }
            Err(e) => Ok(VisitsOutcome {
                success: false,
                visits: Vec::new(),
                error: Some(e.to_string()),
            }),
        }
    }

    /// 修改患者位置，成功后保存提交的位置数据
    pub async fn change_location(&self, patient_key: &str, location: &[NoteField]) -> Result<OperationOutcome> {
        if location.is_empty() {
            return Ok(OperationOutcome::failed("location data is empty"));
        }
        if let Some(e) = location.iter().find_map(|field| validate_field_name(&field.name).err()) {
            return Ok(OperationOutcome::failed(e));
        }

        let result = {
            let mut session = self.portal.lock().await;
            if session.is_connected() {
                session.change_location(patient_key, location).await
            } else {
                Err(PilotError::ConnectionLost("browser not connected".to_string()))
            }
        };

        let report = match result {
            Ok(report) => report,
            Err(e) => return Ok(OperationOutcome::failed(e)),
        };
        if report.filled.is_empty() {
            return Ok(OperationOutcome::failed("no location field could be filled"));
        }

        let mut data = serde_json::Map::new();
        for field in location {
            data.insert(field.name.clone(), serde_json::to_value(&field.value)?);
        }
        let encoded = serde_json::to_string(&data)?;
        if !self.store.update_patient_location(patient_key, &encoded).await? {
            warn!("Patient {} is not stored, location was not saved", patient_key);
        }
        Ok(OperationOutcome::ok())
    }

    // ========== 统计与浏览器 ==========

    pub async fn dashboard_stats(&self, now: DateTime<Utc>) -> Result<DashboardStats> {
        let tasks = self.store.list_tasks(None).await?;
        let total_patients = self.store.list_patients().await?.len();

        let today = now.date_naive();
        let week_start = today - chrono::Duration::days(i64::from(today.weekday().num_days_from_monday()));

        let pending = tasks.iter().filter(|task| task.status == TaskStatus::Scheduled);
        let tasks_today = pending.clone().filter(|task| task.run_at.date_naive() == today).count();
        let tasks_week = pending.filter(|task| task.run_at.date_naive() >= week_start).count();

        let completed_tasks = tasks.iter().filter(|t| t.status == TaskStatus::Completed).count();
        let failed_tasks = tasks.iter().filter(|t| t.status == TaskStatus::Failed).count();
        let executed = completed_tasks + failed_tasks;
        let success_rate = if executed == 0 {
            100.0
        } else {
            (completed_tasks as f64 / executed as f64 * 1000.0).round() / 10.0
        };

        let browser_connected = self.portal.lock().await.is_connected();

        Ok(DashboardStats {
            tasks_today,
            tasks_week,
            total_patients,
            completed_tasks,
            success_rate,
            time_saved_hours: completed_tasks as f64 * HOURS_SAVED_PER_TASK,
            browser_connected,
        })
    }

    /// 建立浏览器自动化通道
    pub async fn connect_browser(&self) -> OperationOutcome {
        let (result, connected) = {
            let mut session = self.portal.lock().await;
            let result = session.connect().await;
            (result, session.is_connected())
        };
        self.notifications
            .live()
            .broadcast(LiveEvent::BrowserStatus { connected });

        match result {
            Ok(()) => OperationOutcome::ok(),
            Err(e) => OperationOutcome::failed(e),
        }
    }

    /// 探测浏览器连接
    pub async fn browser_status(&self) -> BrowserStatus {
        let mut session = self.portal.lock().await;
        let connected = session.check_connection().await;
        BrowserStatus {
            connected,
            state: session.state(),
            authenticated: session.is_authenticated(),
        }
    }

    /// 关闭浏览器会话
    pub async fn disconnect_browser(&self) {
        self.portal.lock().await.disconnect().await;
        self.notifications
            .live()
            .broadcast(LiveEvent::BrowserStatus { connected: false });
    }
}
