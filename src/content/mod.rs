//! 内容恢复与分类
//!
//! 实时推送和历史查询共用同一套解码、分类逻辑。

pub mod classifier;
pub mod decoder;
pub mod markup;

pub use classifier::{Classification, classify, raw_type};
pub use decoder::{DecodeError, decode};

use crate::domain::{DecodedMessage, RawRecord, is_group_destination};

/// 把一条原始记录解码、分类成公开消息
///
/// 发送者规则：本人发送 → `self_id`；原始发送者非空 → 原值；
/// 群聊 → 内容前缀里的发送者；单聊 → 会话本身。
pub fn decode_record(record: &RawRecord, destination: &str, self_id: &str) -> DecodedMessage {
    let content = decode(&record.content, record.compressed_content.as_deref());
    let classification = classify(&content, record.local_type);

    let sender = if record.is_self {
        self_id.to_string()
    } else if !record.sender.is_empty() {
        record.sender.clone()
    } else if is_group_destination(destination) {
        classifier::split_sender_prefix(&content)
            .map(|(sender, _)| sender.to_string())
            .unwrap_or_default()
    } else {
        destination.to_string()
    };

    DecodedMessage {
        local_id: record.local_id,
        create_time: record.create_time,
        local_type: record.local_type,
        msg_type: classification.msg_type,
        summary: classification.summary,
        sender,
        is_self: record.is_self,
        url: classification.url,
        reply_to: classification.reply_to,
        content,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::CanonicalType;

    fn record(sender: &str, is_self: bool, content: &str) -> RawRecord {
        RawRecord {
            local_id: 1,
            local_type: raw_type::TEXT,
            create_time: 1_700_000_000,
            sender: sender.to_string(),
            is_self,
            content: content.to_string(),
            compressed_content: None,
        }
    }

    #[test]
    fn test_self_authored_uses_self_id() {
        let message = decode_record(&record("someone", true, "hi"), "wxid_peer", "wxid_me");
        assert_eq!(message.sender, "wxid_me");
        assert!(message.is_self);
    }

    #[test]
    fn test_group_sender_from_prefix() {
        let message = decode_record(&record("", false, "wxid_a:\nhello"), "1@chatroom", "wxid_me");
        assert_eq!(message.sender, "wxid_a");
        assert_eq!(message.summary, "hello");
        assert_eq!(message.msg_type, CanonicalType::Text);
    }

    #[test]
    fn test_direct_sender_defaults_to_destination() {
        let message = decode_record(&record("", false, "hello"), "wxid_peer", "wxid_me");
        assert_eq!(message.sender, "wxid_peer");
    }

    #[test]
    fn test_hex_content_is_decoded() {
        let message = decode_record(&record("x", false, &hex::encode("decoded via hex!!")), "d", "me");
        assert_eq!(message.content, "decoded via hex!!");
    }
}
