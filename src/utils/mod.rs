//! 工具函数模块
//!
//! 提供时间戳、时间范围解析、连接 ID 生成等通用工具函数

use chrono::{Local, NaiveDate, NaiveTime, TimeZone, Utc};

/// 获取当前时间戳（毫秒）
pub fn current_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// 生成连接 ID
pub fn new_connection_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// 时间边界类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bound {
    Start,
    End,
}

/// 解析时间边界（秒）
///
/// 支持 unix 秒或 `YYYY-MM-DD`（本地时区）；日期作为结束边界时包含当天全部时间。
pub fn parse_time_bound(value: &str, bound: Bound) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(seconds) = value.parse::<i64>() {
        return Some(seconds);
    }

    let date = NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()?;
    let time = match bound {
        Bound::Start => NaiveTime::MIN,
        Bound::End => NaiveTime::from_hms_opt(23, 59, 59)?,
    };

    Local
        .from_local_datetime(&date.and_time(time))
        .earliest()
        .map(|dt| dt.timestamp())
}
