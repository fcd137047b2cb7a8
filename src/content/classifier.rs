//! 消息分类器
//!
//! 把平台原始类型码 + 解码后的文本映射成对外的规范类型和摘要。
//! 分类永远不失败：结构不匹配时退化为去前缀的原文或 `[type N]` 占位。

use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use crate::content::markup::{
    block, collapse_whitespace, looks_escaped, strip_cdata, strip_tags, tag_text,
    unescape_entities,
};
use crate::domain::CanonicalType;

/// 原始类型码
pub mod raw_type {
    pub const TEXT: i64 = 1;
    pub const IMAGE: i64 = 3;
    pub const VOICE: i64 = 34;
    pub const CONTACT: i64 = 42;
    pub const VIDEO: i64 = 43;
    pub const EMOJI: i64 = 47;
    pub const LOCATION: i64 = 48;
    pub const COMPOSITE: i64 = 49;
    pub const CALL: i64 = 50;
    pub const SYSTEM: i64 = 10000;
    pub const SYSTEM_ALT: i64 = 10002;

    /// 引用回复（57 << 32 | 49）
    pub const REPLY: i64 = 244_813_135_921;
    /// 拍一拍（62 << 32 | 49）
    pub const POKE: i64 = 266_287_972_401;
    /// 转账（2000 << 32 | 49）
    pub const TRANSFER: i64 = 8_589_934_592_049;
    /// 红包（2001 << 32 | 49）
    pub const RED_PACKET: i64 = 8_594_229_559_345;
}

/// 复合消息（appmsg）子类型
mod app_type {
    pub const LINK: i64 = 5;
    pub const FILE: i64 = 6;
    pub const FORWARD: i64 = 19;
    pub const MINI_PROGRAM: i64 = 33;
    pub const MINI_PROGRAM_ALT: i64 = 36;
    pub const LINK_ALT: i64 = 49;
    pub const REPLY: i64 = 57;
    pub const POKE: i64 = 62;
    pub const TRANSFER: i64 = 2000;
    pub const RED_PACKET: i64 = 2001;
}

/// 引用消息 ID 可能出现的标签名（按优先级）
const REFERENCE_ID_TAGS: [&str; 4] = ["svrid", "msgsvrid", "newmsgid", "msgid"];

/// `sender-id:` 前缀，后面不能紧跟 `//`
static SENDER_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([A-Za-z0-9_-]+):").expect("valid sender prefix regex"));

static TRAILING_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:^|\s+)\d+\s*$").expect("valid trailing number regex"));

static QUOTED_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"[“"]([^“”"]+)[”"]"#).expect("valid quoted name regex"));

static CALL_DURATION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2}:\d{2}(?::\d{2})?)").expect("valid duration regex"));

static DOMAIN_LIKE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9-]+(\.[A-Za-z0-9-]+)*\.[A-Za-z]{2,}(:\d+)?([/?#].*)?$")
        .expect("valid domain regex")
});

/// 通话状态关键字（按匹配顺序）
const CALL_KEYWORDS: &[(&[&str], &str)] = &[
    (&["no answer", "无应答"], "no answer"),
    (&["cancelled", "canceled", "已取消"], "cancelled"),
    (&["answered elsewhere", "其它设备接听", "其他设备接听"], "answered on another device"),
    (&["declined", "已拒绝"], "declined"),
    (&["busy", "忙线"], "busy"),
    (&["unanswered", "未接听"], "unanswered"),
];

/// 分类结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub msg_type: CanonicalType,
    pub summary: String,
    pub url: Option<String>,
    pub reply_to: Option<String>,
}

impl Classification {
    fn new(msg_type: CanonicalType, summary: impl Into<String>) -> Self {
        Self {
            msg_type,
            summary: summary.into(),
            url: None,
            reply_to: None,
        }
    }
}

/// 对解码后的文本分类
pub fn classify(text: &str, code: i64) -> Classification {
    match code {
        raw_type::TEXT => Classification::new(CanonicalType::Text, strip_sender_prefix(text)),
        raw_type::IMAGE => Classification::new(CanonicalType::Image, "[image]"),
        raw_type::VOICE => Classification::new(CanonicalType::Voice, "[voice]"),
        raw_type::CONTACT => Classification::new(CanonicalType::Contact, "[contact card]"),
        raw_type::VIDEO => Classification::new(CanonicalType::Video, "[video]"),
        raw_type::EMOJI => Classification::new(CanonicalType::Emoji, "[emoji]"),
        raw_type::LOCATION => classify_location(text),
        raw_type::CALL => classify_call(text),
        raw_type::SYSTEM | raw_type::SYSTEM_ALT => classify_system(text),
        raw_type::POKE => classify_poke(text),
        raw_type::REPLY => classify_reply(text),
        raw_type::TRANSFER => classify_composite_as(text, Some(app_type::TRANSFER)),
        raw_type::RED_PACKET => classify_composite_as(text, Some(app_type::RED_PACKET)),
        raw_type::COMPOSITE => classify_composite_as(text, None),
        other => classify_unknown(text, other),
    }
}

/// 去掉 `sender-id:` 前缀并裁剪
pub fn strip_sender_prefix(text: &str) -> String {
    match split_sender_prefix(text) {
        Some((_, body)) => body.trim().to_string(),
        None => text.trim().to_string(),
    }
}

/// 拆出 `sender-id:` 前缀，`https://` 之类的协议头不算前缀
pub fn split_sender_prefix(text: &str) -> Option<(&str, &str)> {
    let caps = SENDER_PREFIX.captures(text)?;
    let whole = caps.get(0)?;
    let rest = &text[whole.end()..];
    if rest.starts_with("//") {
        return None;
    }
    Some((caps.get(1)?.as_str(), rest))
}

fn classify_location(text: &str) -> Classification {
    let body = prepare_markup(text);
    let label = attribute(&body, "location", "poiname")
        .or_else(|| attribute(&body, "location", "label"))
        .filter(|label| !label.is_empty());

    match label {
        Some(label) => Classification::new(CanonicalType::Location, format!("[location] {}", label)),
        None => Classification::new(CanonicalType::Location, "[location]"),
    }
}

fn classify_call(text: &str) -> Classification {
    let body = prepare_markup(text);
    let kind = match tag_text(&body, "room_type").as_deref() {
        Some("0") => "video call",
        Some("1") => "voice call",
        _ => "call",
    };
    let fragment = tag_text(&body, "msg").unwrap_or_default();

    if fragment.is_empty() {
        return Classification::new(CanonicalType::Call, "[call]");
    }

    Classification::new(CanonicalType::Call, format!("[{}] {}", kind, call_status(&fragment)))
}

/// 通话状态短语
fn call_status(fragment: &str) -> String {
    if let Some(duration) = CALL_DURATION.captures(fragment).and_then(|caps| caps.get(1)) {
        return format!("duration {}", duration.as_str());
    }

    let lowered = fragment.to_lowercase();
    CALL_KEYWORDS
        .iter()
        .find(|(keywords, _)| keywords.iter().any(|keyword| lowered.contains(keyword)))
        .map(|(_, phrase)| phrase.to_string())
        .unwrap_or_else(|| fragment.to_string())
}

/// 系统消息：去 CDATA 和标签，去掉末尾孤立数字，合并空白
pub fn clean_system_text(text: &str) -> String {
    let unescaped = unescape_entities(&strip_cdata(text));
    let stripped = collapse_whitespace(&strip_tags(&unescaped));
    let without_number = TRAILING_NUMBER.replace(&stripped, "");
    without_number.trim().to_string()
}

fn classify_system(text: &str) -> Classification {
    let cleaned = clean_system_text(text);
    if cleaned.is_empty() {
        Classification::new(CanonicalType::System, "[system message]")
    } else {
        Classification::new(CanonicalType::System, cleaned)
    }
}

fn classify_poke(text: &str) -> Classification {
    let cleaned = clean_system_text(text);
    let names: Vec<&str> = QUOTED_NAME
        .captures_iter(&cleaned)
        .filter_map(|caps| caps.get(1).map(|m| m.as_str().trim()))
        .filter(|name| !name.is_empty())
        .take(2)
        .collect();

    let summary = match names.as_slice() {
        [from, to] => format!("“{}” poked “{}”", from, to),
        _ if cleaned.is_empty() => "[poke]".to_string(),
        _ => cleaned.clone(),
    };

    Classification::new(CanonicalType::Poke, summary)
}

fn classify_reply(text: &str) -> Classification {
    let body = prepare_markup(text);
    let app = block(&body, "appmsg").unwrap_or(&body);
    let title = tag_text(app, "title").unwrap_or_default();

    let mut classification = Classification::new(CanonicalType::Reply, reply_summary(&title));
    classification.reply_to = extract_reply_target(&body);
    classification
}

fn reply_summary(title: &str) -> String {
    if title.starts_with("[reply]") {
        title.to_string()
    } else if title.is_empty() {
        "[reply]".to_string()
    } else {
        format!("[reply] {}", title)
    }
}

/// 复合消息：读取 appmsg 的 type/title 细化摘要
///
/// `forced_type` 用于哨兵类型码已经隐含子类型的情况。
fn classify_composite_as(text: &str, forced_type: Option<i64>) -> Classification {
    let body = prepare_markup(text);
    let app = block(&body, "appmsg").unwrap_or(&body);
    let sub_type = forced_type.or_else(|| tag_text(app, "type").and_then(|t| t.parse().ok()));
    let title = tag_text(app, "title");

    match sub_type {
        Some(app_type::TRANSFER) => {
            let fee = tag_text(app, "feedesc");
            let memo = tag_text(app, "pay_memo");
            let summary = match (fee, memo) {
                (Some(fee), Some(memo)) => format!("[transfer] {} {}", fee, memo),
                (Some(fee), None) => format!("[transfer] {}", fee),
                (None, Some(memo)) => format!("[transfer] {}", memo),
                (None, None) => "[transfer]".to_string(),
            };
            Classification::new(CanonicalType::Transfer, summary)
        }
        Some(app_type::RED_PACKET) => Classification::new(
            CanonicalType::RedPacket,
            labeled("[red packet]", title.as_deref()),
        ),
        Some(app_type::FILE) => {
            Classification::new(CanonicalType::File, labeled("[file]", title.as_deref()))
        }
        Some(app_type::FORWARD) => Classification::new(
            CanonicalType::Forward,
            labeled("[chat history]", title.as_deref()),
        ),
        Some(app_type::MINI_PROGRAM) | Some(app_type::MINI_PROGRAM_ALT) => Classification::new(
            CanonicalType::Share,
            labeled("[mini program]", title.as_deref()),
        ),
        Some(app_type::REPLY) => {
            let mut classification = Classification::new(
                CanonicalType::Reply,
                reply_summary(title.as_deref().unwrap_or_default()),
            );
            classification.reply_to = extract_reply_target(&body);
            classification
        }
        Some(app_type::POKE) => classify_poke(text),
        Some(app_type::LINK) | Some(app_type::LINK_ALT) => {
            let mut classification =
                Classification::new(CanonicalType::Link, labeled("[link]", title.as_deref()));
            classification.url = tag_text(app, "url").and_then(|url| normalize_url(&url));
            classification
        }
        _ => Classification::new(CanonicalType::Link, labeled("[link]", title.as_deref())),
    }
}

fn classify_unknown(text: &str, raw: i64) -> Classification {
    if text.contains("<appmsg") || text.contains("&lt;appmsg") {
        return classify_composite_as(text, None);
    }

    // 高 32 位携带子类型的复合码
    if raw > u32::MAX as i64 && raw & 0xFFFF_FFFF == raw_type::COMPOSITE {
        return classify_composite_as(text, Some(raw >> 32));
    }

    let stripped = strip_sender_prefix(text);
    if stripped.is_empty() || stripped.starts_with('<') {
        Classification::new(CanonicalType::Other, format!("[type {}]", raw))
    } else {
        Classification::new(CanonicalType::Other, stripped)
    }
}

/// 查找被引用消息的数字 ID：依次搜索 refermsg 块、appmsg 块、全文
pub fn extract_reply_target(text: &str) -> Option<String> {
    let body = prepare_markup(text);
    let scopes = [block(&body, "refermsg"), block(&body, "appmsg"), Some(body.as_str())];

    scopes.into_iter().flatten().find_map(|scope| {
        REFERENCE_ID_TAGS.iter().find_map(|tag| {
            tag_text(scope, tag).filter(|value| value.bytes().all(|b| b.is_ascii_digit()))
        })
    })
}

/// 规范化链接：无协议但像域名时补 https，最终必须是合法 http/https
pub fn normalize_url(raw: &str) -> Option<String> {
    let candidate = unescape_entities(raw.trim());
    if candidate.is_empty() {
        return None;
    }

    let candidate = if candidate.contains("://") {
        candidate
    } else if let Some(rest) = candidate.strip_prefix("//") {
        format!("https://{}", rest)
    } else if DOMAIN_LIKE.is_match(&candidate) {
        format!("https://{}", candidate)
    } else {
        return None;
    };

    let parsed = Url::parse(&candidate).ok()?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Some(parsed.to_string()),
        _ => None,
    }
}

/// 去掉发送者前缀；转义过的 XML 先反转义
fn prepare_markup(text: &str) -> String {
    let body = match split_sender_prefix(text) {
        Some((_, rest)) if rest.trim_start().starts_with('<') || rest.contains("&lt;") => rest,
        _ => text,
    };

    if looks_escaped(body) {
        unescape_entities(body)
    } else {
        body.to_string()
    }
}

fn labeled(label: &str, title: Option<&str>) -> String {
    match title {
        Some(title) if !title.is_empty() => format!("{} {}", label, title),
        _ => label.to_string(),
    }
}

/// 读取开标签上的属性值
fn attribute(xml: &str, tag: &str, name: &str) -> Option<String> {
    let open = format!("<{}", tag);
    let start = xml.find(&open)?;
    let end = start + xml[start..].find('>')?;
    let head = &xml[start..end];

    let key = format!("{}=\"", name);
    let value_start = head.find(&key)? + key.len();
    let value_end = value_start + head[value_start..].find('"')?;
    Some(unescape_entities(&head[value_start..value_end]))
}
