//! # Chartpilot 数据库模块
//!
//! 负责账户、患者快照和计划任务的持久化，提供内存实现和 PostgreSQL 实现。

pub mod connection;
pub mod memory;
pub mod models;
pub mod queries;
pub mod store;

// 重新导出主要类型
pub use connection::DatabasePool;
pub use memory::MemoryTaskStore;
pub use queries::PgTaskStore;
pub use store::TaskStore;
