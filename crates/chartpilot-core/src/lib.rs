//! # Chartpilot Core
//!
//! 临床文书自动化系统的核心模块，提供数据模型、错误定义、后台任务循环和凭据保管接口。

pub mod error;
pub mod models;
pub mod utils;
pub mod vault;
pub mod worker;

pub use error::{PilotError, Result};
pub use models::*;
pub use vault::{PlaintextVault, SecretsVault};
pub use worker::PeriodicWorker;
