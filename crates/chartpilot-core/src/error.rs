//! 错误定义模块

use thiserror::Error;

/// 系统统一错误类型
///
/// 门户相关的错误（元素、超时、登录、手势）在工作流边界被捕获并以值的形式返回；
/// 只有 `Store` 允许继续向上传播。
#[derive(Error, Debug, Clone)]
pub enum PilotError {
    #[error("元素未找到: {0}")]
    ElementNotFound(String),

    #[error("等待超时: {0}")]
    Timeout(String),

    #[error("连接丢失: {0}")]
    ConnectionLost(String),

    #[error("登录失败: {0}")]
    LoginFailed(String),

    #[error("签名手势中止: {0}")]
    GestureAbort(String),

    #[error("存储错误: {0}")]
    Store(String),

    #[error("外部推送失败: {0}")]
    ExternalPush(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("验证错误: {0}")]
    Validation(String),

    #[error("资源未找到: {0}")]
    NotFound(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("系统内部错误: {0}")]
    Internal(String),

    #[error("无效状态转换: 从 {from} 到 {event}")]
    InvalidStateTransition { from: String, event: String },
}

impl From<serde_json::Error> for PilotError {
    fn from(e: serde_json::Error) -> Self {
        PilotError::Serialization(e.to_string())
    }
}

#[cfg(feature = "database")]
impl From<sqlx::Error> for PilotError {
    fn from(e: sqlx::Error) -> Self {
        PilotError::Store(e.to_string())
    }
}

/// 统一结果类型
pub type Result<T> = std::result::Result<T, PilotError>;
