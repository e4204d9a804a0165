//! 告警系统
//!
//! 规则按事件数据求值，命中后广播通知并依次执行规则动作。

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chartpilot_core::Severity;
use chartpilot_integration::{NotificationManager, WebhookClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// 告警规则
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub name: String,
    /// 字段名到条件的映射，全部满足才命中
    #[serde(default)]
    pub conditions: BTreeMap<String, Condition>,
    #[serde(default)]
    pub alert: AlertTemplate,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
}

/// 单个字段的条件：比较谓词或精确相等
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    Predicate(Predicate),
    Equals(Value),
}

/// `{gt, lt, eq}` 比较谓词
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Predicate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<Value>,
}

/// 命中后广播的通知内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertTemplate {
    pub title: String,
    pub message: String,
    #[serde(alias = "type")]
    pub severity: Severity,
}

/// 命中后执行的动作
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlertAction {
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Webhook {
        url: String,
    },
}

impl Default for AlertTemplate {
    fn default() -> Self {
        Self {
            title: "System Alert".to_string(),
            message: "Alert condition triggered".to_string(),
            severity: Severity::Warning,
        }
    }
}

impl Predicate {
    pub fn gt(value: impl Into<Value>) -> Self {
        Self {
            gt: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn lt(value: impl Into<Value>) -> Self {
        Self {
            lt: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn equal_to(value: impl Into<Value>) -> Self {
        Self {
            eq: Some(value.into()),
            ..Self::default()
        }
    }

    fn matches(&self, actual: &Value) -> bool {
        if let Some(bound) = &self.gt {
            if compare(actual, bound) != Some(Ordering::Greater) {
                return false;
            }
        }
        if let Some(bound) = &self.lt {
            if compare(actual, bound) != Some(Ordering::Less) {
                return false;
            }
        }
        if let Some(expected) = &self.eq {
            if !values_equal(actual, expected) {
                return false;
            }
        }
        true
    }
}

impl Condition {
    pub fn matches(&self, actual: &Value) -> bool {
        match self {
            Condition::Predicate(predicate) => predicate.matches(actual),
            Condition::Equals(expected) => values_equal(actual, expected),
        }
    }
}

impl AlertRule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            conditions: BTreeMap::new(),
            alert: AlertTemplate::default(),
            actions: Vec::new(),
        }
    }

    pub fn when(mut self, field: impl Into<String>, condition: Condition) -> Self {
        self.conditions.insert(field.into(), condition);
        self
    }

    pub fn alert(mut self, title: &str, message: &str, severity: Severity) -> Self {
        self.alert = AlertTemplate {
            title: title.to_string(),
            message: message.to_string(),
            severity,
        };
        self
    }

    pub fn action(mut self, action: AlertAction) -> Self {
        self.actions.push(action);
        self
    }

    /// 缺失字段视为不满足
    pub fn matches(&self, event_data: &Value) -> bool {
        self.conditions.iter().all(|(field, condition)| match event_data.get(field) {
            Some(actual) => condition.matches(actual),
            None => false,
        })
    }
}

/// 数字按数值比较，其余类型要求完全相等
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => actual == expected,
    }
}

/// 数字按数值、字符串按字典序比较，其他组合不可比较
fn compare(actual: &Value, bound: &Value) -> Option<Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// 内置规则
pub fn default_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("High Task Failure Rate")
            .when("task_failure_rate", Condition::Predicate(Predicate::gt(0.5)))
            .when("time_window", Condition::Equals(json!("last_hour")))
            .alert(
                "High Task Failure Rate",
                "More than 50% of tasks have failed in the last hour",
                Severity::Error,
            )
            .action(AlertAction::Log {
                message: Some("High task failure rate detected".to_string()),
            }),
        AlertRule::new("Browser Connection Lost")
            .when("browser_connected", Condition::Predicate(Predicate::equal_to(false)))
            .when("duration", Condition::Predicate(Predicate::gt(300)))
            .alert(
                "Extended Browser Disconnection",
                "Browser has been disconnected for more than 5 minutes",
                Severity::Error,
            ),
        AlertRule::new("System Resource Critical")
            .when("memory_usage", Condition::Predicate(Predicate::gt(95)))
            .when("cpu_usage", Condition::Predicate(Predicate::gt(95)))
            .alert(
                "Critical System Resources",
                "System resources are critically high",
                Severity::Error,
            ),
    ]
}

/// 告警系统
pub struct AlertSystem {
    rules: RwLock<Vec<AlertRule>>,
    notifications: Arc<NotificationManager>,
    webhook: WebhookClient,
}

impl std::fmt::Debug for AlertSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlertSystem").finish_non_exhaustive()
    }
}

impl AlertSystem {
    /// 创建空规则集的告警系统
    pub fn new(notifications: Arc<NotificationManager>, webhook_timeout: Duration) -> Result<Self> {
        let webhook = WebhookClient::new(webhook_timeout).context("Failed to build webhook client")?;
        Ok(Self {
            rules: RwLock::new(Vec::new()),
            notifications,
            webhook,
        })
    }

    /// 创建并加载内置规则
    pub async fn with_default_rules(notifications: Arc<NotificationManager>, webhook_timeout: Duration) -> Result<Self> {
        let system = Self::new(notifications, webhook_timeout)?;
        for rule in default_rules() {
            system.add_rule(rule).await;
        }
        Ok(system)
    }

    /// 注册规则
    pub async fn add_rule(&self, rule: AlertRule) {
        info!("Alert rule registered: {}", rule.name);
        self.rules.write().await.push(rule);
    }

    pub async fn rules(&self) -> Vec<AlertRule> {
        self.rules.read().await.clone()
    }

    /// 从 JSON 文件加载规则数组，返回加载数量
    pub async fn load_rules_file(&self, path: impl AsRef<Path>) -> Result<usize> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read alert rules file {}", path.display()))?;
        let rules: Vec<AlertRule> = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse alert rules file {}", path.display()))?;

        let count = rules.len();
        for rule in rules {
            self.add_rule(rule).await;
        }
        info!("Loaded {} alert rules from {}", count, path.display());
        Ok(count)
    }

    /// 对事件数据求值所有规则，返回命中的规则名
    pub async fn check_alerts(&self, event_data: &Value) -> Vec<String> {
        let matched: Vec<AlertRule> = {
            let rules = self.rules.read().await;
            rules.iter().filter(|rule| rule.matches(event_data)).cloned().collect()
        };

        let mut fired = Vec::with_capacity(matched.len());
        for rule in matched {
            self.trigger(&rule, event_data).await;
            fired.push(rule.name);
        }

        if fired.is_empty() {
            debug!("No alert rule matched event data");
        }
        fired
    }

    async fn trigger(&self, rule: &AlertRule, event_data: &Value) {
        warn!("Alert rule triggered: {}", rule.name);
        self.notifications
            .broadcast(&rule.alert.title, &rule.alert.message, rule.alert.severity)
            .await;

        for action in &rule.actions {
            match action {
                AlertAction::Log { message } => {
                    let message = message.as_deref().unwrap_or(&rule.alert.message);
                    warn!(rule = %rule.name, event = %event_data, "Alert action: {}", message);
                }
                AlertAction::Webhook { url } => {
                    if let Err(e) = self.webhook.post_json(url, event_data).await {
                        warn!("Alert webhook for rule {} failed: {}", rule.name, e);
                    }
                }
            }
        }
    }
}
