//! 变更信号
//!
//! 两种可互换的信号源：
//! - [`PipeSignal`]：访问器推送通道（Unix socket / 命名管道上的 NDJSON 通知）
//! - [`PollSignal`]：推送不可用时的定时轮询
//!
//! [`SignalSupervisor`] 负责在两者之间切换，对下游只输出统一的 [`ChangeSignal`]。

pub mod backoff;
pub mod connector;
pub mod pipe;
pub mod poll;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;
pub mod supervisor;

use serde::{Deserialize, Serialize};

pub use backoff::PipeBackoff;
pub use connector::{DisabledConnector, PipeConnector, PipeStream, default_connector};
pub use pipe::{PipeSignal, PipeSignalHandle, PipeState};
pub use poll::PollSignal;
#[cfg(any(test, feature = "test-util"))]
pub use scripted::ScriptedConnector;
pub use supervisor::{SignalSupervisor, SupervisorHandle};

/// 信号来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalOrigin {
    Pipe,
    Poll,
}

/// 变更信号：`destination` 为空表示"有变化，但不知道是哪个会话"
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSignal {
    pub destination: Option<String>,
    pub origin: SignalOrigin,
}

impl ChangeSignal {
    pub fn directed(destination: impl Into<String>, origin: SignalOrigin) -> Self {
        Self { destination: Some(destination.into()), origin }
    }

    pub fn undirected(origin: SignalOrigin) -> Self {
        Self { destination: None, origin }
    }
}

/// 推送通道事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipeEvent {
    /// 连接已建立
    Connected,
    /// 收到一条变更通知
    Change {
        action: String,
        destination: Option<String>,
    },
    /// 连接断开，将按退避重连
    Disconnected,
    /// 重试耗尽，推送不可用
    Unavailable,
}

/// 当前信号模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveMode {
    /// 推送启动中，尚未确认
    Starting,
    /// 推送通道已连接
    Push,
    /// 轮询兜底
    Poll,
    /// 已停止
    Stopped,
}

impl LiveMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveMode::Starting => "starting",
            LiveMode::Push => "push",
            LiveMode::Poll => "poll",
            LiveMode::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for LiveMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
