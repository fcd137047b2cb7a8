//! 内存访问器
//!
//! 用于测试和快照回放。内部状态放在 `Arc<Mutex<..>>` 里，克隆出的句柄共享同一份数据，
//! 测试可以在访问器移交给队列之后继续写入新消息、注入故障。

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Deserialize;
use tracing::{debug, info};

use super::{AccessorError, Batch, ChatAccessor, CursorHandle, TimeRange};
use crate::content::raw_type;
use crate::domain::{DestinationInfo, RawRecord};

/// 快照文件格式
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub destinations: Vec<SnapshotDestination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotDestination {
    pub destination: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub records: Vec<RawRecord>,
}

#[derive(Debug, Default)]
struct DestinationState {
    display_name: Option<String>,
    /// 按 local_id 升序
    records: Vec<RawRecord>,
}

#[derive(Debug)]
struct CursorState {
    records: Vec<RawRecord>,
    position: usize,
    batch_size: usize,
}

#[derive(Debug, Default)]
struct MemoryStore {
    destinations: BTreeMap<String, DestinationState>,
    cursors: HashMap<u64, CursorState>,
    next_cursor: u64,
    channel_open: bool,
    channel_open_calls: u32,
    channel_failures_left: u32,
    failing_destinations: HashSet<String>,
}

/// 内存访问器
#[derive(Debug, Clone, Default)]
pub struct MemoryAccessor {
    store: Arc<Mutex<MemoryStore>>,
}

impl MemoryAccessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 快照构建
    pub fn from_snapshot(snapshot: Snapshot) -> Self {
        let accessor = Self::new();
        for entry in snapshot.destinations {
            if let Some(name) = entry.display_name {
                accessor.set_display_name(&entry.destination, &name);
            }
            accessor.ensure_destination(&entry.destination);
            for record in entry.records {
                accessor.push_record(&entry.destination, record);
            }
        }
        accessor
    }

    /// 读取快照文件
    pub fn load_snapshot(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context;

        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read snapshot {}", path.display()))?;
        let snapshot: Snapshot = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse snapshot {}", path.display()))?;

        let accessor = Self::from_snapshot(snapshot);
        info!(
            path = %path.display(),
            destinations = accessor.lock().destinations.len(),
            "Loaded accessor snapshot"
        );
        Ok(accessor)
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStore> {
        // 测试中断言失败可能污染锁，数据本身仍然可用
        self.store.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn ensure_destination(&self, destination: &str) {
        self.lock().destinations.entry(destination.to_string()).or_default();
    }

    pub fn set_display_name(&self, destination: &str, name: &str) {
        self.lock()
            .destinations
            .entry(destination.to_string())
            .or_default()
            .display_name = Some(name.to_string());
    }

    /// 写入一条记录（已存在的 local_id 会被覆盖）
    pub fn push_record(&self, destination: &str, record: RawRecord) {
        let mut store = self.lock();
        let records = &mut store.destinations.entry(destination.to_string()).or_default().records;
        match records.binary_search_by_key(&record.local_id, |r| r.local_id) {
            Ok(pos) => records[pos] = record,
            Err(pos) => records.insert(pos, record),
        }
    }

    /// 写入一条纯文本消息，local_id 自动递增
    pub fn push_text(&self, destination: &str, sender: &str, text: &str, create_time: i64) -> i64 {
        let local_id = self
            .lock()
            .destinations
            .get(destination)
            .and_then(|state| state.records.last())
            .map_or(1, |last| last.local_id + 1);

        self.push_record(
            destination,
            RawRecord {
                local_id,
                local_type: raw_type::TEXT,
                create_time,
                sender: sender.to_string(),
                is_self: false,
                content: text.to_string(),
                compressed_content: None,
            },
        );
        local_id
    }

    /// 接下来 n 次创建推送通道失败
    pub fn fail_channel_opens(&self, n: u32) {
        self.lock().channel_failures_left = n;
    }

    /// 该会话的所有游标操作失败
    pub fn fail_destination(&self, destination: &str, failing: bool) {
        let mut store = self.lock();
        if failing {
            store.failing_destinations.insert(destination.to_string());
        } else {
            store.failing_destinations.remove(destination);
        }
    }

    pub fn channel_open(&self) -> bool {
        self.lock().channel_open
    }

    pub fn channel_open_calls(&self) -> u32 {
        self.lock().channel_open_calls
    }

    /// 当前未关闭的游标数
    pub fn open_cursor_count(&self) -> usize {
        self.lock().cursors.len()
    }
}

impl ChatAccessor for MemoryAccessor {
    fn open_change_channel(&mut self) -> Result<(), AccessorError> {
        let mut store = self.lock();
        store.channel_open_calls += 1;
        if store.channel_failures_left > 0 {
            store.channel_failures_left -= 1;
            return Err(AccessorError::ChannelUnavailable("injected failure".to_string()));
        }
        store.channel_open = true;
        Ok(())
    }

    fn close_change_channel(&mut self) -> Result<(), AccessorError> {
        self.lock().channel_open = false;
        Ok(())
    }

    fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>, AccessorError> {
        let store = self.lock();
        Ok(store
            .destinations
            .iter()
            .map(|(destination, state)| DestinationInfo {
                destination: destination.clone(),
                display_name: state.display_name.clone(),
                last_timestamp: state.records.iter().map(|r| r.create_time).max().unwrap_or(0),
            })
            .collect())
    }

    fn open_cursor(
        &mut self,
        destination: &str,
        batch_size: usize,
        ascending: bool,
        range: TimeRange,
    ) -> Result<CursorHandle, AccessorError> {
        if batch_size == 0 {
            return Err(AccessorError::Cursor("batch size must be positive".to_string()));
        }

        let mut store = self.lock();
        if store.failing_destinations.contains(destination) {
            return Err(AccessorError::Query(format!("injected failure for {}", destination)));
        }

        let state = store
            .destinations
            .get(destination)
            .ok_or_else(|| AccessorError::UnknownDestination(destination.to_string()))?;

        let mut records: Vec<RawRecord> = state
            .records
            .iter()
            .filter(|r| range.contains(r.create_time))
            .cloned()
            .collect();
        if !ascending {
            records.reverse();
        }

        store.next_cursor += 1;
        let id = store.next_cursor;
        store.cursors.insert(id, CursorState { records, position: 0, batch_size });
        debug!(destination, cursor = id, ascending, "Cursor opened");
        Ok(CursorHandle(id))
    }

    fn fetch_batch(&mut self, cursor: CursorHandle) -> Result<Batch, AccessorError> {
        let mut store = self.lock();
        let state = store
            .cursors
            .get_mut(&cursor.0)
            .ok_or_else(|| AccessorError::Cursor(format!("unknown cursor {}", cursor.0)))?;

        let end = (state.position + state.batch_size).min(state.records.len());
        let records = state.records[state.position..end].to_vec();
        state.position = end;

        Ok(Batch { records, has_more: end < state.records.len() })
    }

    fn close_cursor(&mut self, cursor: CursorHandle) -> Result<(), AccessorError> {
        self.lock()
            .cursors
            .remove(&cursor.0)
            .map(|_| ())
            .ok_or_else(|| AccessorError::Cursor(format!("unknown cursor {}", cursor.0)))
    }

    fn display_names(&mut self, ids: &[String]) -> Result<HashMap<String, String>, AccessorError> {
        let store = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| {
                let name = store.destinations.get(id)?.display_name.clone()?;
                Some((id.clone(), name))
            })
            .collect())
    }
}
