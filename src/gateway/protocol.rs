//! 订阅协议
//!
//! JSON 文本帧，以 `type` 字段区分：
//!
//! 客户端 → 服务端：`subscribe` / `unsubscribe` / `subscribe_all` / `ping` / `status`
//!
//! 服务端 → 客户端：`connected` / `subscribed` / `unsubscribed` / `pong` / `status` /
//! `error` / `new_message`

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{LiveError, Result};
use crate::live::{NewMessageEvent, Subscription};
use crate::signal::LiveMode;

/// 通配订阅在 `subscribed` 事件中的表示
pub const WILDCARD: &str = "*";

const KNOWN_COMMANDS: [&str; 5] = ["subscribe", "unsubscribe", "subscribe_all", "ping", "status"];

/// 客户端命令
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        #[serde(default)]
        destinations: Vec<String>,
    },
    Unsubscribe {
        #[serde(default)]
        destinations: Option<Vec<String>>,
    },
    SubscribeAll,
    Ping,
    Status,
}

/// 连接状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub connection_id: String,
    pub subscription: Subscription,
    pub mode: LiveMode,
    pub connections: usize,
    pub baselined_destinations: usize,
}

/// 服务端事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },
    Subscribed {
        destinations: Vec<String>,
    },
    Unsubscribed {
        destinations: Vec<String>,
    },
    Pong {
        timestamp: i64,
    },
    Status(StatusPayload),
    Error {
        message: String,
    },
    NewMessage(NewMessageEvent),
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error { message: message.into() }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// 解析客户端文本帧
pub fn parse_command(text: &str) -> Result<ClientCommand> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| LiveError::Protocol(format!("malformed frame: {}", e)))?;

    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_string) else {
        crate::bail_protocol!("malformed frame: missing \"type\"");
    };

    if !KNOWN_COMMANDS.contains(&kind.as_str()) {
        crate::bail_protocol!("unknown command type: {}", kind);
    }

    serde_json::from_value(value)
        .map_err(|e| LiveError::Protocol(format!("invalid {} command: {}", kind, e)))
}
