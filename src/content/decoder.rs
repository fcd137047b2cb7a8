//! 消息内容解码器
//!
//! 访问器返回的内容字段可能是：
//! - 十六进制文本（二进制列被转成 hex）
//! - base64 文本
//! - 已经是明文
//!
//! 解出的字节如果以 zstd 帧魔数开头则先解压，再按 UTF-8 解码；
//! UTF-8 损坏比例过高时退化为单字节解码。
//!
//! 内部全部使用 `Result<String, DecodeError>`，只在 [`decode`] 这一处兜底为空串。

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;
use tracing::debug;

/// zstd 帧魔数 0xFD2FB528（小端序）
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// 超过该长度的纯十六进制文本一律按 hex 处理
pub const HEX_MIN_LEN: usize = 16;

/// 替换字符占比上限，超过则退化为单字节解码
const REPLACEMENT_RATIO_LIMIT: f64 = 0.2;

/// 解码错误
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("zstd decompression failed: {0}")]
    Zstd(#[source] std::io::Error),
}

/// 解码内容字段，优先使用非空的压缩字段
///
/// 任何阶段失败都返回空串，内容恢复是尽力而为的。
pub fn decode(primary: &str, secondary: Option<&str>) -> String {
    let candidate = match secondary {
        Some(value) if !value.trim().is_empty() => value,
        _ => primary,
    };

    match try_decode(candidate) {
        Ok(text) => text,
        Err(err) => {
            debug!(error = %err, len = candidate.len(), "content decode failed, using empty text");
            String::new()
        }
    }
}

/// 解码单个字段
pub fn try_decode(field: &str) -> Result<String, DecodeError> {
    let trimmed = field.trim();
    if trimmed.is_empty() {
        return Ok(String::new());
    }

    if is_hex(trimmed) {
        if trimmed.len() > HEX_MIN_LEN {
            let bytes = hex::decode(trimmed)?;
            return decode_bytes(&bytes);
        }

        // 短 hex 只有在解出非 ASCII 的合法 UTF-8 或压缩帧时才采用
        if let Ok(bytes) = hex::decode(trimmed) {
            if is_compressed(&bytes) || is_non_ascii_utf8(&bytes) {
                return decode_bytes(&bytes);
            }
        }
    }

    if is_base64(trimmed) {
        if let Ok(bytes) = STANDARD.decode(trimmed) {
            if is_compressed(&bytes) || std::str::from_utf8(&bytes).is_ok() {
                return decode_bytes(&bytes);
            }
        }
    }

    Ok(field.to_string())
}

/// 解码二进制内容
pub fn decode_bytes(bytes: &[u8]) -> Result<String, DecodeError> {
    if is_compressed(bytes) {
        let raw = zstd::stream::decode_all(bytes).map_err(DecodeError::Zstd)?;
        return Ok(bytes_to_text(&raw));
    }

    Ok(bytes_to_text(bytes))
}

/// 字节转文本：UTF-8 损坏少则丢弃替换字符，否则按单字节解码
pub fn bytes_to_text(bytes: &[u8]) -> String {
    if bytes.is_empty() {
        return String::new();
    }

    let lossy = String::from_utf8_lossy(bytes);
    let replaced = lossy.chars().filter(|ch| *ch == char::REPLACEMENT_CHARACTER).count();

    if (replaced as f64) / (bytes.len() as f64) < REPLACEMENT_RATIO_LIMIT {
        lossy.chars().filter(|ch| *ch != char::REPLACEMENT_CHARACTER).collect()
    } else {
        bytes.iter().map(|&b| b as char).collect()
    }
}

fn is_compressed(bytes: &[u8]) -> bool {
    bytes.len() > ZSTD_MAGIC.len() && bytes[..ZSTD_MAGIC.len()] == ZSTD_MAGIC
}

fn is_non_ascii_utf8(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok_and(|text| !text.is_ascii())
}

fn is_hex(value: &str) -> bool {
    value.len() % 2 == 0 && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn is_base64(value: &str) -> bool {
    if value.len() % 4 != 0 {
        return false;
    }

    let body = value.trim_end_matches('=');
    value.len() - body.len() <= 2
        && !body.is_empty()
        && body
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/')
}
