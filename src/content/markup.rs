//! 轻量级标记提取工具
//!
//! 消息负载中的 XML 片段经常不完整、混有转义或 CDATA，
//! 这里只做按标签名的宽松查找，不做完整解析。

/// 去掉 CDATA 包裹
pub fn strip_cdata(value: &str) -> String {
    value.replace("<![CDATA[", "").replace("]]>", "")
}

/// 反转义常见 HTML 实体（含数字实体）
pub fn unescape_entities(value: &str) -> String {
    if !value.contains('&') {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('&') {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];

        let Some(end) = tail.find(';').filter(|end| *end <= 10) else {
            out.push('&');
            rest = &tail[1..];
            continue;
        };

        let entity = &tail[1..end];
        let decoded = match entity {
            "lt" => Some('<'),
            "gt" => Some('>'),
            "amp" => Some('&'),
            "quot" => Some('"'),
            "apos" => Some('\''),
            "nbsp" => Some(' '),
            _ => entity
                .strip_prefix("#x")
                .or_else(|| entity.strip_prefix("#X"))
                .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                .or_else(|| entity.strip_prefix('#').and_then(|dec| dec.parse().ok()))
                .and_then(char::from_u32),
        };

        match decoded {
            Some(ch) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = &tail[1..];
            }
        }
    }

    out.push_str(rest);
    out
}

/// 去掉所有标签，只保留文本
pub fn strip_tags(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut in_tag = false;

    for ch in value.chars() {
        match ch {
            '<' => in_tag = true,
            '>' if in_tag => {
                in_tag = false;
                out.push(' ');
            }
            _ if !in_tag => out.push(ch),
            _ => {}
        }
    }

    out
}

/// 合并连续空白
pub fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// 查找标签块的内部内容（第一个匹配）
///
/// 兼容 `<tag>`、`<tag attr="..">` 两种开标签写法，自闭合标签返回 None。
pub fn block<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{}", tag);
    let close = format!("</{}>", tag);
    let mut offset = 0;

    while let Some(rel) = xml[offset..].find(&open) {
        let start = offset + rel;
        let after_name = start + open.len();
        let next = xml[after_name..].chars().next()?;

        // 排除 <title> 命中 <titlex> 的情况
        if next != '>' && !next.is_whitespace() {
            offset = after_name;
            continue;
        }

        let open_end = after_name + xml[after_name..].find('>')?;
        if xml[..open_end].ends_with('/') {
            offset = open_end + 1;
            continue;
        }

        let body_start = open_end + 1;
        let body_end = body_start + xml[body_start..].find(&close)?;
        return Some(&xml[body_start..body_end]);
    }

    None
}

/// 读取标签文本：去 CDATA、反转义、去首尾空白，空值返回 None
pub fn tag_text(xml: &str, tag: &str) -> Option<String> {
    let raw = block(xml, tag)?;
    let text = unescape_entities(strip_cdata(raw).trim());
    let text = text.trim();
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// 内容是否为被转义过的 XML
pub fn looks_escaped(value: &str) -> bool {
    value.contains("&lt;") && !value.contains('<')
}
