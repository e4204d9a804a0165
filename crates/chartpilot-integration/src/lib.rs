//! # Chartpilot 集成模块
//!
//! 提供与外部系统的集成功能，包括：
//! - 实时事件通道，按用户或广播投递
//! - 外部推送网关
//! - Webhook 调用
//! - 通知管理与任务通知

pub mod live;
pub mod notification;
pub mod push;
pub mod webhook;

pub use live::{LiveEvent, LiveHub, LiveMessage, LiveSubscription};
pub use notification::{NotificationManager, TaskNotifier, SYSTEM_USER};
pub use push::{NtfyGateway, PushGateway};
pub use webhook::WebhookClient;
