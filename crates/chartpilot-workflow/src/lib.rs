//! # Chartpilot 工作流模块
//!
//! 提供自动化工作流功能，包括：
//! - 任务状态机：计划任务只能从 scheduled 单向进入终态
//! - 任务调度器：轮询到期任务并通过门户会话执行
//! - 自动化服务：账户、任务、患者与浏览器操作的统一入口

pub mod scheduler;
pub mod service;
pub mod state_machine;

pub use scheduler::{PollSummary, TaskScheduler};
pub use service::{
    AccountRequest, AutomationService, BrowserStatus, DashboardStats, FetchOutcome, OperationOutcome, VisitsOutcome,
};
pub use state_machine::{TaskEvent, TaskStateMachine};
