//! 数据访问器
//!
//! 真正的存储（打开、解密、索引）在外部实现，这里只定义边界：
//! - [`ChatAccessor`]：单个可变会话句柄，不允许并发调用
//! - [`AccessorQueue`]：把所有调用串行化到一个 FIFO 队列
//! - [`MemoryAccessor`]：内存实现，用于测试和回放快照

pub mod memory;
pub mod queue;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{DestinationInfo, RawRecord};

pub use memory::MemoryAccessor;
pub use queue::{AccessorHandle, AccessorQueue};

/// 访问器错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AccessorError {
    /// 推送通道创建失败
    #[error("change channel unavailable: {0}")]
    ChannelUnavailable(String),

    /// 游标错误
    #[error("cursor error: {0}")]
    Cursor(String),

    /// 查询失败
    #[error("query failed: {0}")]
    Query(String),

    /// 会话不存在
    #[error("unknown destination: {0}")]
    UnknownDestination(String),

    /// 访问器队列已关闭
    #[error("accessor queue closed")]
    QueueClosed,
}

/// 游标句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CursorHandle(pub u64);

/// 时间范围（秒，闭区间，缺省表示不限）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl TimeRange {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start.is_none_or(|start| timestamp >= start)
            && self.end.is_none_or(|end| timestamp <= end)
    }
}

/// 一批记录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub records: Vec<RawRecord>,
    pub has_more: bool,
}

/// 聊天数据访问器
///
/// 实现方持有唯一的会话句柄，所有方法都在队列工作线程上顺序调用。
pub trait ChatAccessor: Send + 'static {
    /// 创建推送通道
    fn open_change_channel(&mut self) -> Result<(), AccessorError>;

    /// 关闭推送通道（幂等）
    fn close_change_channel(&mut self) -> Result<(), AccessorError>;

    /// 列出所有会话
    fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>, AccessorError>;

    /// 打开游标
    fn open_cursor(
        &mut self,
        destination: &str,
        batch_size: usize,
        ascending: bool,
        range: TimeRange,
    ) -> Result<CursorHandle, AccessorError>;

    /// 读取下一批
    fn fetch_batch(&mut self, cursor: CursorHandle) -> Result<Batch, AccessorError>;

    /// 关闭游标
    fn close_cursor(&mut self, cursor: CursorHandle) -> Result<(), AccessorError>;

    /// 查询显示名
    fn display_names(&mut self, ids: &[String]) -> Result<HashMap<String, String>, AccessorError> {
        let _ = ids;
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_bounds_are_inclusive() {
        let range = TimeRange::new(Some(10), Some(20));
        assert!(range.contains(10));
        assert!(range.contains(20));
        assert!(!range.contains(9));
        assert!(!range.contains(21));
        assert!(TimeRange::default().contains(i64::MIN));
    }
}
