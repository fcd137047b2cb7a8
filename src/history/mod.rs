//! 历史消息查询
//!
//! 与实时推送共用同一套游标接口和解码、分类逻辑：
//! 升序打开游标、按时间范围过滤、分批读取直到达到条数上限。

use serde::Serialize;
use tracing::{debug, warn};

use crate::accessor::{AccessorError, AccessorHandle, TimeRange};
use crate::config::HistoryConfig;
use crate::content::decode_record;
use crate::domain::{DecodedMessage, DestinationInfo, sort_by_recency};
use crate::error::{LiveError, Result};
use crate::utils::{Bound, parse_time_bound};

/// 查询参数（原始字符串，未校验）
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub talker: String,
    pub limit: Option<usize>,
    pub start: Option<String>,
    pub end: Option<String>,
}

/// 查询结果
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub talker: String,
    pub count: usize,
    pub messages: Vec<DecodedMessage>,
}

/// 历史查询服务
#[derive(Clone)]
pub struct HistoryService {
    accessor: AccessorHandle,
    self_id: String,
    config: HistoryConfig,
}

impl HistoryService {
    pub fn new(accessor: AccessorHandle, self_id: impl Into<String>, config: HistoryConfig) -> Self {
        Self {
            accessor,
            self_id: self_id.into(),
            config,
        }
    }

    /// 查询一个会话的历史消息（按时间正序）
    pub async fn messages(&self, query: &HistoryQuery) -> Result<HistoryPage> {
        let talker = query.talker.trim();
        if talker.is_empty() {
            return Err(LiveError::Protocol("talker is required".to_string()));
        }

        let limit = self.resolve_limit(query.limit)?;
        let range = resolve_range(query.start.as_deref(), query.end.as_deref())?;

        let cursor = self
            .accessor
            .open_cursor(talker, self.config.batch_size, true, range)
            .await
            .map_err(|e| match e {
                AccessorError::UnknownDestination(d) => LiveError::UnknownDestination(d),
                other => LiveError::Accessor(other),
            })?;

        let collected = self.collect(cursor, limit).await;

        if let Err(e) = self.accessor.close_cursor(cursor).await {
            warn!(talker = %talker, error = %e, "Failed to close history cursor");
        }

        let messages: Vec<DecodedMessage> = collected?
            .iter()
            .map(|record| decode_record(record, talker, &self.self_id))
            .collect();

        debug!(talker = %talker, count = messages.len(), "History query served");
        Ok(HistoryPage {
            talker: talker.to_string(),
            count: messages.len(),
            messages,
        })
    }

    /// 会话列表（最近活跃在前）
    ///
    /// 访问器列表里缺显示名的会话再批量查一次联系人；查询失败只记日志。
    pub async fn sessions(&self) -> Result<Vec<DestinationInfo>> {
        let mut list = self.accessor.list_destinations().await?;

        let missing: Vec<String> = list
            .iter()
            .filter(|info| info.display_name.is_none())
            .map(|info| info.destination.clone())
            .collect();
        if !missing.is_empty() {
            match self.accessor.display_names(missing).await {
                Ok(names) => {
                    for info in list.iter_mut().filter(|info| info.display_name.is_none()) {
                        info.display_name = names.get(&info.destination).cloned();
                    }
                }
                Err(e) => warn!(error = %e, "Failed to resolve display names"),
            }
        }

        sort_by_recency(&mut list);
        Ok(list)
    }

    async fn collect(
        &self,
        cursor: crate::accessor::CursorHandle,
        limit: usize,
    ) -> std::result::Result<Vec<crate::domain::RawRecord>, AccessorError> {
        let mut records = Vec::new();
        loop {
            let batch = self.accessor.fetch_batch(cursor).await?;
            records.extend(batch.records);
            if !batch.has_more || records.len() >= limit {
                break;
            }
        }
        records.truncate(limit);
        Ok(records)
    }

    fn resolve_limit(&self, limit: Option<usize>) -> Result<usize> {
        match limit {
            None => Ok(self.config.default_limit),
            Some(0) => Err(LiveError::Protocol("limit must be positive".to_string())),
            Some(n) => Ok(n.min(self.config.max_limit)),
        }
    }
}

/// 解析时间范围
pub fn resolve_range(start: Option<&str>, end: Option<&str>) -> Result<TimeRange> {
    let parse = |value: Option<&str>, bound: Bound, name: &str| -> Result<Option<i64>> {
        match value.map(str::trim).filter(|v| !v.is_empty()) {
            None => Ok(None),
            Some(v) => parse_time_bound(v, bound)
                .map(Some)
                .ok_or_else(|| LiveError::Protocol(format!("invalid {}: {}", name, v))),
        }
    };

    let range = TimeRange::new(parse(start, Bound::Start, "start")?, parse(end, Bound::End, "end")?);
    if let (Some(s), Some(e)) = (range.start, range.end) {
        if s > e {
            return Err(LiveError::Protocol("start must not be after end".to_string()));
        }
    }
    Ok(range)
}
