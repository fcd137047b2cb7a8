//! 增量拉取
//!
//! 读取会话最新的 K 条记录（按时间倒序），过滤已投递的 ID，
//! 解码、分类后按时间正序返回。

use tracing::{debug, warn};

use super::seen_set::SeenSet;
use crate::accessor::{AccessorError, AccessorHandle, TimeRange};
use crate::content::decode_record;
use crate::domain::{DecodedMessage, RawRecord};

/// 增量拉取器
#[derive(Clone)]
pub struct IncrementalFetcher {
    accessor: AccessorHandle,
    limit: usize,
    self_id: String,
}

impl IncrementalFetcher {
    pub fn new(accessor: AccessorHandle, limit: usize, self_id: impl Into<String>) -> Self {
        Self {
            accessor,
            limit: limit.max(1),
            self_id: self_id.into(),
        }
    }

    /// 最新的 K 条原始记录（新的在前）
    ///
    /// 打开、读取、关闭各自排队；读取失败也会关闭游标。
    pub async fn fetch_latest(&self, destination: &str) -> Result<Vec<RawRecord>, AccessorError> {
        let cursor = self
            .accessor
            .open_cursor(destination, self.limit, false, TimeRange::default())
            .await?;

        let batch = self.accessor.fetch_batch(cursor).await;

        if let Err(e) = self.accessor.close_cursor(cursor).await {
            warn!(destination = %destination, error = %e, "Failed to close cursor");
        }

        let mut records = batch?.records;
        records.truncate(self.limit);
        Ok(records)
    }

    /// 冷启动：把当前最新记录全部记为已投递，不产出消息
    pub async fn seed(&self, destination: &str, seen: &mut SeenSet) -> Result<usize, AccessorError> {
        let records = self.fetch_latest(destination).await?;
        for record in records.iter().rev() {
            seen.insert(record.local_id);
        }
        seen.trim();

        debug!(destination = %destination, seeded = records.len(), "Destination baselined");
        Ok(records.len())
    }

    /// 拉取未投递的消息，按时间正序返回，并写回已投递集合
    pub async fn fetch_unseen(
        &self,
        destination: &str,
        seen: &mut SeenSet,
    ) -> Result<Vec<DecodedMessage>, AccessorError> {
        let records = self.fetch_latest(destination).await?;

        // 倒序读取，按旧到新写入集合，淘汰时先丢最旧的
        let fresh: Vec<DecodedMessage> = records
            .iter()
            .rev()
            .filter(|record| seen.insert(record.local_id))
            .map(|record| decode_record(record, destination, &self.self_id))
            .collect();
        seen.trim();

        if !fresh.is_empty() {
            debug!(destination = %destination, count = fresh.len(), "Fetched new messages");
        }
        Ok(fresh)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{AccessorQueue, MemoryAccessor};

    fn setup(limit: usize) -> (MemoryAccessor, IncrementalFetcher) {
        let memory = MemoryAccessor::new();
        let handle = AccessorQueue::spawn(Box::new(memory.clone())).unwrap();
        (memory, IncrementalFetcher::new(handle, limit, "wxid_me"))
    }

    #[tokio::test]
    async fn test_seed_then_fetch_only_new_in_order() {
        let (memory, fetcher) = setup(10);
        for i in 0..3 {
            memory.push_text("wxid_a", "wxid_a", &format!("old {}", i), 100 + i);
        }

        let mut seen = SeenSet::new(1000);
        assert_eq!(fetcher.seed("wxid_a", &mut seen).await.unwrap(), 3);
        assert!(fetcher.fetch_unseen("wxid_a", &mut seen).await.unwrap().is_empty());

        memory.push_text("wxid_a", "wxid_a", "new 1", 200);
        memory.push_text("wxid_a", "wxid_a", "new 2", 201);

        let fresh = fetcher.fetch_unseen("wxid_a", &mut seen).await.unwrap();
        let summaries: Vec<_> = fresh.iter().map(|m| m.summary.as_str()).collect();
        assert_eq!(summaries, vec!["new 1", "new 2"]);
        assert!(fetcher.fetch_unseen("wxid_a", &mut seen).await.unwrap().is_empty());
        assert_eq!(memory.open_cursor_count(), 0);
    }

    #[tokio::test]
    async fn test_seen_set_stays_bounded() {
        let (memory, fetcher) = setup(10);
        let mut seen = SeenSet::new(5);
        for i in 0..30 {
            memory.push_text("wxid_a", "wxid_a", "x", i);
            fetcher.fetch_unseen("wxid_a", &mut seen).await.unwrap();
            assert!(seen.len() <= 5);
        }
    }

    #[tokio::test]
    async fn test_unknown_destination_errors() {
        let (_memory, fetcher) = setup(10);
        let mut seen = SeenSet::new(10);
        assert!(matches!(
            fetcher.fetch_unseen("missing", &mut seen).await,
            Err(AccessorError::UnknownDestination(_))
        ));
    }
}
