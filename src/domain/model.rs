//! 领域模型
//!
//! - `RawRecord`：访问器返回的一行原始记录
//! - `DecodedMessage`：解码、分类后对订阅者公开的消息
//! - `DestinationInfo`：会话列表项（带最近活跃时间）

use serde::{Deserialize, Serialize};

/// 群聊会话后缀
pub const GROUP_SUFFIX: &str = "@chatroom";

/// 是否为群聊会话
pub fn is_group_destination(destination: &str) -> bool {
    destination.ends_with(GROUP_SUFFIX)
}

/// 访问器返回的原始记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// 本地 ID，同一会话内随插入顺序递增（不保证连续）
    #[serde(alias = "localId")]
    pub local_id: i64,
    /// 原始类型码
    #[serde(alias = "localType", alias = "type")]
    pub local_type: i64,
    /// 创建时间（秒）
    #[serde(alias = "createTime")]
    pub create_time: i64,
    /// 发送者标识，群聊中可能为空（发送者编码在内容前缀里）
    #[serde(default)]
    pub sender: String,
    /// 是否为本人发送
    #[serde(default, alias = "isSelf")]
    pub is_self: bool,
    /// 主内容字段
    #[serde(default)]
    pub content: String,
    /// 压缩内容字段
    #[serde(default, alias = "compressContent")]
    pub compressed_content: Option<String>,
}

/// 规范消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalType {
    Text,
    Image,
    Voice,
    Video,
    File,
    Emoji,
    Link,
    Location,
    Contact,
    Call,
    System,
    Reply,
    Forward,
    Share,
    Transfer,
    RedPacket,
    Poke,
    Other,
}

impl CanonicalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalType::Text => "text",
            CanonicalType::Image => "image",
            CanonicalType::Voice => "voice",
            CanonicalType::Video => "video",
            CanonicalType::File => "file",
            CanonicalType::Emoji => "emoji",
            CanonicalType::Link => "link",
            CanonicalType::Location => "location",
            CanonicalType::Contact => "contact",
            CanonicalType::Call => "call",
            CanonicalType::System => "system",
            CanonicalType::Reply => "reply",
            CanonicalType::Forward => "forward",
            CanonicalType::Share => "share",
            CanonicalType::Transfer => "transfer",
            CanonicalType::RedPacket => "red_packet",
            CanonicalType::Poke => "poke",
            CanonicalType::Other => "other",
        }
    }
}

impl std::fmt::Display for CanonicalType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 解码、分类后的消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedMessage {
    pub local_id: i64,
    pub create_time: i64,
    /// 原始类型码
    pub local_type: i64,
    #[serde(rename = "type")]
    pub msg_type: CanonicalType,
    pub summary: String,
    /// 发送者；本人发送时替换为本人标识
    pub sender: String,
    pub is_self: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    /// 解码后的原文
    pub content: String,
}

/// 会话列表项
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationInfo {
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// 最近一条消息时间（秒）
    #[serde(default)]
    pub last_timestamp: i64,
}

/// 按最近活跃排序（新的在前）
pub fn sort_by_recency(destinations: &mut [DestinationInfo]) {
    destinations.sort_by(|a, b| {
        b.last_timestamp
            .cmp(&a.last_timestamp)
            .then_with(|| a.destination.cmp(&b.destination))
    });
}
