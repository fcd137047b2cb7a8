//! Chatlog Live 公共库
//!
//! 聊天记录归档的实时更新链路：监听访问器的变更通知（不可用时回退到轮询），
//! 增量读取受影响会话的最新消息，去重后推送给 WebSocket 订阅者。

pub mod accessor;
pub mod config;
pub mod content;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod history;
pub mod live;
pub mod metrics;
pub mod service;
pub mod signal;
pub mod tracing;
pub mod utils;

pub use accessor::{AccessorError, AccessorHandle, AccessorQueue, ChatAccessor, MemoryAccessor};
pub use config::{ConfigManager, LiveAppConfig, app_config, load_config};
pub use domain::{CanonicalType, DecodedMessage, DestinationInfo, RawRecord};
pub use error::{LiveError, Result};
pub use live::{DedupBroadcaster, NewMessageEvent, SubscriptionRegistry};
pub use service::{ApplicationBootstrap, LivePipeline};
pub use signal::{ChangeSignal, LiveMode};
