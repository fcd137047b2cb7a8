//! 访问器 FIFO 调用队列
//!
//! 访问器只有一个可变会话句柄，不允许并发调用。
//! 所有组件（拉取器、轮询、推送通道、历史查询）都通过 [`AccessorHandle`] 提交任务，
//! 任务在唯一的工作线程上按提交顺序逐个执行。

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::thread;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::{AccessorError, Batch, ChatAccessor, CursorHandle, TimeRange};
use crate::domain::DestinationInfo;

type Job = Box<dyn FnOnce(&mut dyn ChatAccessor) + Send>;

/// 访问器队列
pub struct AccessorQueue;

impl AccessorQueue {
    /// 把访问器移交给专用工作线程，返回可克隆的调用句柄
    ///
    /// 所有句柄被丢弃后工作线程退出。
    pub fn spawn(accessor: Box<dyn ChatAccessor>) -> Result<AccessorHandle, AccessorError> {
        let (tx, rx) = mpsc::unbounded_channel::<Job>();

        thread::Builder::new()
            .name("accessor-queue".to_string())
            .spawn(move || run_worker(accessor, rx))
            .map_err(|e| AccessorError::Query(format!("failed to spawn accessor worker: {}", e)))?;

        info!("Accessor queue started");
        Ok(AccessorHandle { tx })
    }
}

fn run_worker(mut accessor: Box<dyn ChatAccessor>, mut rx: mpsc::UnboundedReceiver<Job>) {
    let mut executed: u64 = 0;

    while let Some(job) = rx.blocking_recv() {
        executed += 1;
        // 任务 panic 时 oneshot 发送端随之丢弃，调用方收到 Query 错误
        if catch_unwind(AssertUnwindSafe(|| job(accessor.as_mut()))).is_err() {
            error!(job = executed, "Accessor job panicked");
        }
    }

    debug!(executed, "Accessor queue drained, worker exiting");
}

/// 访问器调用句柄
#[derive(Clone)]
pub struct AccessorHandle {
    tx: mpsc::UnboundedSender<Job>,
}

impl AccessorHandle {
    /// 提交任意访问器调用并等待结果
    pub async fn call<T, F>(&self, f: F) -> Result<T, AccessorError>
    where
        F: FnOnce(&mut dyn ChatAccessor) -> Result<T, AccessorError> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::new(move |accessor| {
            let _ = result_tx.send(f(accessor));
        });

        self.tx.send(job).map_err(|_| AccessorError::QueueClosed)?;

        result_rx
            .await
            .map_err(|_| AccessorError::Query("accessor call aborted".to_string()))?
    }

    pub async fn open_change_channel(&self) -> Result<(), AccessorError> {
        self.call(|accessor| accessor.open_change_channel()).await
    }

    pub async fn close_change_channel(&self) -> Result<(), AccessorError> {
        self.call(|accessor| accessor.close_change_channel()).await
    }

    pub async fn list_destinations(&self) -> Result<Vec<DestinationInfo>, AccessorError> {
        self.call(|accessor| accessor.list_destinations()).await
    }

    pub async fn open_cursor(
        &self,
        destination: &str,
        batch_size: usize,
        ascending: bool,
        range: TimeRange,
    ) -> Result<CursorHandle, AccessorError> {
        let destination = destination.to_string();
        self.call(move |accessor| accessor.open_cursor(&destination, batch_size, ascending, range))
            .await
    }

    pub async fn fetch_batch(&self, cursor: CursorHandle) -> Result<Batch, AccessorError> {
        self.call(move |accessor| accessor.fetch_batch(cursor)).await
    }

    pub async fn close_cursor(&self, cursor: CursorHandle) -> Result<(), AccessorError> {
        self.call(move |accessor| accessor.close_cursor(cursor)).await
    }

    pub async fn display_names(
        &self,
        ids: Vec<String>,
    ) -> Result<HashMap<String, String>, AccessorError> {
        self.call(move |accessor| accessor.display_names(&ids)).await
    }
}
