//! 统一错误类型模块
//!
//! - `LiveError`：实时推送链路对外暴露的统一错误
//! - 访问器、解码等子模块的错误通过 `#[from]` 汇聚到这里

use thiserror::Error;

pub use crate::accessor::AccessorError;
pub use crate::content::decoder::DecodeError;

/// 实时推送服务错误类型
#[derive(Debug, Error)]
pub enum LiveError {
    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 数据访问器错误
    #[error("Accessor error: {0}")]
    Accessor(#[from] AccessorError),

    /// 订阅协议错误（格式错误的帧、未知命令）
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// 未知会话
    #[error("Unknown destination: {0}")]
    UnknownDestination(String),

    /// JSON 序列化错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// 统一 Result 别名
pub type Result<T> = std::result::Result<T, LiveError>;

/// 便捷宏：构造协议错误并提前返回
#[macro_export]
macro_rules! bail_protocol {
    ($($arg:tt)*) => {
        return Err($crate::error::LiveError::Protocol(format!($($arg)*)))
    };
}
