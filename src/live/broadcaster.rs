//! 去重广播
//!
//! - 指向具体会话的信号立即检查该会话，不经过防抖
//! - 推送通道的无目标信号合并成一次防抖后的全量扫描
//! - 轮询信号直接扫描
//!
//! 同一时刻最多一次全量扫描：上一次扫描未结束时丢弃轮询扫描，防抖扫描顺延。
//!
//! 每个会话一把异步锁，读已投递集合、判断新消息、写回、发布在同一临界区内完成；
//! 会话第一次被检查时只建立基线，不发布任何消息。

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::fetcher::IncrementalFetcher;
use super::seen_set::SeenSet;
use super::subscription::SubscriptionRegistry;
use crate::accessor::{AccessorError, AccessorHandle};
use crate::config::LiveConfig;
use crate::domain::sort_by_recency;
use crate::metrics::LIVE_METRICS;
use crate::signal::{ChangeSignal, SignalOrigin};

type SeenSlot = Arc<Mutex<Option<SeenSet>>>;

/// 检查结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckOutcome {
    /// 无人订阅，跳过
    Skipped,
    /// 首次观察，建立基线
    Baselined,
    /// 发布了 n 条新消息
    Published(usize),
}

/// 去重广播器
pub struct DedupBroadcaster {
    fetcher: IncrementalFetcher,
    accessor: AccessorHandle,
    registry: Arc<SubscriptionRegistry>,
    seen: DashMap<String, SeenSlot>,
    baselined: AtomicUsize,
    sweeping: AtomicBool,
    capacity: usize,
    debounce: Duration,
    sweep_limit: usize,
}

impl DedupBroadcaster {
    pub fn new(
        fetcher: IncrementalFetcher,
        accessor: AccessorHandle,
        registry: Arc<SubscriptionRegistry>,
        config: &LiveConfig,
    ) -> Self {
        Self {
            fetcher,
            accessor,
            registry,
            seen: DashMap::new(),
            baselined: AtomicUsize::new(0),
            sweeping: AtomicBool::new(false),
            // 容量小于拉取条数时被淘汰的旧记录会再次被判为新消息
            capacity: config.seen_capacity.max(config.fetch_limit),
            debounce: Duration::from_millis(config.debounce_ms),
            sweep_limit: config.wildcard_sweep_limit,
        }
    }

    /// 消费变更信号直到取消或信号源关闭
    pub async fn run(
        self: Arc<Self>,
        mut signals: mpsc::Receiver<ChangeSignal>,
        cancel: CancellationToken,
    ) {
        info!(debounce_ms = self.debounce.as_millis() as u64, "Broadcaster started");
        let mut sweep_at: Option<Instant> = None;

        loop {
            let deadline = sweep_at;
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    // 扫描进行中时顺延到下一个防抖窗口
                    sweep_at = if self.spawn_sweep("debounced") {
                        None
                    } else {
                        Some(Instant::now() + self.debounce)
                    };
                }
                signal = signals.recv() => {
                    let Some(signal) = signal else { break };
                    match (signal.destination, signal.origin) {
                        (Some(destination), origin) => self.spawn_check(destination, origin),
                        (None, SignalOrigin::Poll) => {
                            self.spawn_sweep("poll");
                        }
                        (None, SignalOrigin::Pipe) => {
                            if sweep_at.is_none() {
                                sweep_at = Some(Instant::now() + self.debounce);
                            }
                        }
                    }
                }
            }
        }

        info!("Broadcaster stopped");
    }

    fn spawn_check(self: &Arc<Self>, destination: String, origin: SignalOrigin) {
        let this = self.clone();
        let trigger = match origin {
            SignalOrigin::Pipe => "pipe",
            SignalOrigin::Poll => "poll",
        };
        tokio::spawn(async move {
            if let Err(e) = this.check(&destination, trigger).await {
                warn!(destination = %destination, error = %e, "Directed check failed");
            }
        });
    }

    /// 后台扫描；上一次扫描仍在进行时跳过，返回是否已启动
    pub fn spawn_sweep(self: &Arc<Self>, trigger: &'static str) -> bool {
        if self
            .sweeping
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!(trigger, "Sweep already in flight, skipping");
            LIVE_METRICS.sweeps_skipped_total.inc();
            return false;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _guard = SweepGuard(&this.sweeping);
            this.sweep(trigger).await;
        });
        true
    }

    /// 是否有扫描正在进行
    pub fn sweep_in_flight(&self) -> bool {
        self.sweeping.load(Ordering::Acquire)
    }

    /// 检查单个会话
    pub async fn check(
        &self,
        destination: &str,
        trigger: &str,
    ) -> Result<CheckOutcome, AccessorError> {
        if !self.registry.is_interested(destination).await {
            debug!(destination = %destination, "No subscribers, skipping check");
            return Ok(CheckOutcome::Skipped);
        }

        let slot = self.slot(destination);
        let mut guard = slot.lock().await;

        LIVE_METRICS.checks_total.with_label_values(&[trigger]).inc();
        let _timer = LIVE_METRICS.check_duration_seconds.start_timer();

        let seen = match guard.as_mut() {
            Some(seen) => seen,
            None => {
                self.seed_slot(destination, &mut guard).await?;
                return Ok(CheckOutcome::Baselined);
            }
        };

        let fresh = self
            .fetcher
            .fetch_unseen(destination, seen)
            .await
            .inspect_err(|_| record_failure("fetch"))?;

        for message in &fresh {
            let delivered = self.registry.publish(destination, message).await;
            debug!(
                destination = %destination,
                local_id = message.local_id,
                delivered,
                "Published new message"
            );
        }
        LIVE_METRICS.messages_published_total.inc_by(fresh.len() as u64);

        Ok(CheckOutcome::Published(fresh.len()))
    }

    /// 为尚未观察过的会话建立基线（订阅时调用，避免订阅后第一条消息被当作基线吞掉）
    pub async fn baseline(&self, destination: &str) -> Result<bool, AccessorError> {
        let slot = self.slot(destination);
        let mut guard = slot.lock().await;
        if guard.is_some() {
            return Ok(false);
        }

        self.seed_slot(destination, &mut guard).await?;
        Ok(true)
    }

    async fn seed_slot(
        &self,
        destination: &str,
        slot: &mut Option<SeenSet>,
    ) -> Result<(), AccessorError> {
        let mut seen = SeenSet::new(self.capacity);
        self.fetcher
            .seed(destination, &mut seen)
            .await
            .inspect_err(|_| record_failure("seed"))?;
        *slot = Some(seen);
        self.baselined.fetch_add(1, Ordering::Relaxed);
        LIVE_METRICS.baselines_seeded_total.inc();
        Ok(())
    }

    /// 批量建立基线，失败的会话留到下一次检查
    pub async fn baseline_many(&self, destinations: &[String]) {
        for destination in destinations {
            if let Err(e) = self.baseline(destination).await {
                warn!(destination = %destination, error = %e, "Failed to baseline destination");
            }
        }
    }

    /// 全量扫描：逐个检查，单个失败不影响其余
    pub async fn sweep(&self, trigger: &str) -> usize {
        let targets = match self.sweep_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                record_failure("list_destinations");
                warn!(error = %e, "Failed to resolve sweep targets");
                return 0;
            }
        };

        if trigger == "poll" {
            LIVE_METRICS.poll_sweeps_total.inc();
        }

        let mut published = 0;
        for destination in &targets {
            match self.check(destination, trigger).await {
                Ok(CheckOutcome::Published(n)) => published += n,
                Ok(_) => {}
                Err(e) => {
                    warn!(destination = %destination, error = %e, "Check failed, skipping destination");
                }
            }
        }

        debug!(trigger, targets = targets.len(), published, "Sweep finished");
        published
    }

    /// 扫描目标：有通配订阅时取最近活跃的 N 个会话，再并上显式订阅的会话
    pub async fn sweep_targets(&self) -> Result<Vec<String>, AccessorError> {
        let mut targets: BTreeSet<String> =
            self.registry.subscribed_destinations().await.into_iter().collect();

        if self.registry.has_wildcard().await {
            let mut destinations = self.accessor.list_destinations().await?;
            sort_by_recency(&mut destinations);
            targets.extend(
                destinations
                    .into_iter()
                    .take(self.sweep_limit)
                    .map(|info| info.destination),
            );
        }

        Ok(targets.into_iter().collect())
    }

    /// 已建立基线的会话数
    pub fn baselined_count(&self) -> usize {
        self.baselined.load(Ordering::Relaxed)
    }

    /// 会话已投递集合大小；未观察过返回 None
    pub async fn seen_len(&self, destination: &str) -> Option<usize> {
        let slot = self.seen.get(destination)?.value().clone();
        let guard = slot.lock().await;
        guard.as_ref().map(SeenSet::len)
    }

    fn slot(&self, destination: &str) -> SeenSlot {
        self.seen
            .entry(destination.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .value()
            .clone()
    }
}

/// 扫描结束（包括 panic）时清除进行中标记
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

fn record_failure(operation: &str) {
    LIVE_METRICS
        .accessor_failures_total
        .with_label_values(&[operation])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{
        AccessorQueue, Batch, ChatAccessor, CursorHandle, MemoryAccessor, TimeRange,
    };
    use crate::domain::DestinationInfo;

    /// 列会话很慢的访问器
    struct SlowListing {
        inner: MemoryAccessor,
        list_calls: Arc<AtomicUsize>,
    }

    impl ChatAccessor for SlowListing {
        fn open_change_channel(&mut self) -> Result<(), AccessorError> {
            self.inner.open_change_channel()
        }

        fn close_change_channel(&mut self) -> Result<(), AccessorError> {
            self.inner.close_change_channel()
        }

        fn list_destinations(&mut self) -> Result<Vec<DestinationInfo>, AccessorError> {
            self.list_calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            self.inner.list_destinations()
        }

        fn open_cursor(
            &mut self,
            destination: &str,
            batch_size: usize,
            ascending: bool,
            range: TimeRange,
        ) -> Result<CursorHandle, AccessorError> {
            self.inner.open_cursor(destination, batch_size, ascending, range)
        }

        fn fetch_batch(&mut self, cursor: CursorHandle) -> Result<Batch, AccessorError> {
            self.inner.fetch_batch(cursor)
        }

        fn close_cursor(&mut self, cursor: CursorHandle) -> Result<(), AccessorError> {
            self.inner.close_cursor(cursor)
        }
    }

    async fn setup() -> (MemoryAccessor, Arc<SubscriptionRegistry>, DedupBroadcaster) {
        let memory = MemoryAccessor::new();
        let handle = AccessorQueue::spawn(Box::new(memory.clone())).unwrap();
        let registry = Arc::new(SubscriptionRegistry::new(64));
        let config = LiveConfig::default();
        let fetcher = IncrementalFetcher::new(handle.clone(), config.fetch_limit, "wxid_me");
        let broadcaster = DedupBroadcaster::new(fetcher, handle, registry.clone(), &config);
        (memory, registry, broadcaster)
    }

    #[tokio::test]
    async fn test_first_check_only_baselines() {
        let (memory, registry, broadcaster) = setup().await;
        memory.push_text("wxid_a", "wxid_a", "backlog", 1);
        let mut rx = registry.register("c1").await;
        registry.subscribe("c1", &["wxid_a".to_string()]).await;

        assert_eq!(broadcaster.check("wxid_a", "test").await.unwrap(), CheckOutcome::Baselined);
        assert!(rx.try_recv().is_err());

        memory.push_text("wxid_a", "wxid_a", "fresh", 2);
        assert_eq!(broadcaster.check("wxid_a", "test").await.unwrap(), CheckOutcome::Published(1));
        assert_eq!(rx.recv().await.unwrap().message.summary, "fresh");

        assert_eq!(broadcaster.check("wxid_a", "test").await.unwrap(), CheckOutcome::Published(0));
        assert_eq!(broadcaster.baselined_count(), 1);
    }

    #[tokio::test]
    async fn test_skips_destinations_without_subscribers() {
        let (memory, _registry, broadcaster) = setup().await;
        memory.push_text("wxid_a", "wxid_a", "hi", 1);
        assert_eq!(broadcaster.check("wxid_a", "test").await.unwrap(), CheckOutcome::Skipped);
        assert_eq!(broadcaster.seen_len("wxid_a").await, None);
    }

    #[tokio::test]
    async fn test_sweep_continues_past_failing_destination() {
        let (memory, registry, broadcaster) = setup().await;
        memory.push_text("bad", "bad", "x", 1);
        memory.push_text("good", "good", "x", 1);
        let mut rx = registry.register("c1").await;
        registry.subscribe("c1", &["bad".to_string(), "good".to_string()]).await;

        broadcaster.sweep("test").await;
        memory.fail_destination("bad", true);
        memory.push_text("good", "good", "y", 2);

        assert_eq!(broadcaster.sweep("test").await, 1);
        assert_eq!(rx.recv().await.unwrap().destination, "good");
    }

    #[tokio::test]
    async fn test_wildcard_sweep_targets_most_recent() {
        let (memory, registry, broadcaster) = setup().await;
        for i in 0..30 {
            memory.push_text(&format!("d{:02}", i), "x", "x", i);
        }
        let _rx = registry.register("c1").await;
        registry.subscribe_all("c1").await;

        let targets = broadcaster.sweep_targets().await.unwrap();
        assert_eq!(targets.len(), 20);
        assert!(targets.contains(&"d29".to_string()));
        assert!(!targets.contains(&"d09".to_string()));
    }

    #[tokio::test]
    async fn test_overlapping_sweeps_are_skipped() {
        let (memory, registry, broadcaster) = setup().await;
        memory.push_text("wxid_a", "wxid_a", "x", 1);
        let _rx = registry.register("c1").await;
        registry.subscribe_all("c1").await;
        let broadcaster = Arc::new(broadcaster);

        assert!(broadcaster.spawn_sweep("poll"));
        assert!(broadcaster.sweep_in_flight());
        assert!(!broadcaster.spawn_sweep("poll"));
        assert!(!broadcaster.spawn_sweep("debounced"));

        tokio::time::timeout(Duration::from_secs(5), async {
            while broadcaster.sweep_in_flight() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broadcaster.seen_len("wxid_a").await, Some(1));

        assert!(broadcaster.spawn_sweep("poll"));
    }

    #[tokio::test]
    async fn test_slow_poll_sweeps_do_not_pile_up() {
        let memory = MemoryAccessor::new();
        memory.push_text("wxid_a", "wxid_a", "x", 1);
        let list_calls = Arc::new(AtomicUsize::new(0));
        let handle = AccessorQueue::spawn(Box::new(SlowListing {
            inner: memory.clone(),
            list_calls: list_calls.clone(),
        }))
        .unwrap();

        let registry = Arc::new(SubscriptionRegistry::new(64));
        let config = LiveConfig::default();
        let fetcher = IncrementalFetcher::new(handle.clone(), config.fetch_limit, "wxid_me");
        let broadcaster = Arc::new(DedupBroadcaster::new(
            fetcher,
            handle.clone(),
            registry.clone(),
            &config,
        ));
        let _rx = registry.register("c1").await;
        registry.subscribe_all("c1").await;

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(broadcaster.clone().run(rx, cancel.clone()));

        // 50 ms 一次轮询，单次扫描至少 200 ms
        for _ in 0..20 {
            tx.send(ChangeSignal::undirected(SignalOrigin::Poll)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(list_calls.load(Ordering::SeqCst) <= 7);

        // 访问器队列没有积压
        let started = std::time::Instant::now();
        handle.close_change_channel().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_baseline_prevents_swallowing_first_message() {
        let (memory, registry, broadcaster) = setup().await;
        memory.push_text("wxid_a", "wxid_a", "old", 1);
        let mut rx = registry.register("c1").await;
        registry.subscribe("c1", &["wxid_a".to_string()]).await;
        broadcaster.baseline_many(&["wxid_a".to_string()]).await;

        memory.push_text("wxid_a", "wxid_a", "first live", 2);
        assert_eq!(broadcaster.check("wxid_a", "test").await.unwrap(), CheckOutcome::Published(1));
        assert_eq!(rx.recv().await.unwrap().message.summary, "first live");
    }
}
