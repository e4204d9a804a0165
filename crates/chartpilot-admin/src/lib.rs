//! # Chartpilot 管理模块
//!
//! 提供运维功能：
//! - 配置加载、校验与保存
//! - 基于规则的告警
//! - 浏览器连接与主机资源监控

pub mod alerting;
pub mod config;
pub mod monitoring;

pub use alerting::{AlertAction, AlertRule, AlertSystem, AlertTemplate, Condition, Predicate};
pub use config::{
    AlertsConfig, AppConfig, ConfigManager, ConfigValidator, DatabaseBackend, DatabaseConfig, LogFormat,
    LoggingConfig, MonitorConfig, NotificationsConfig, SchedulerConfig,
};
pub use monitoring::{HostProbe, HostSnapshot, MonitorSettings, SysinfoProbe, SystemMonitor, TickReport};
