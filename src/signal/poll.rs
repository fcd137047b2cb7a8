//! 轮询信号源
//!
//! 推送不可用时按固定间隔发出扫描信号；没有任何订阅时不发信号。
//! 启停是电平触发的：重复 `start` / `stop` 都是空操作。

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{ChangeSignal, SignalOrigin};
use crate::live::SubscriptionRegistry;

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// 轮询信号源
pub struct PollSignal {
    interval: Duration,
    registry: Arc<SubscriptionRegistry>,
    signals: mpsc::Sender<ChangeSignal>,
    running: Mutex<Option<Running>>,
}

impl PollSignal {
    pub fn new(
        interval: Duration,
        registry: Arc<SubscriptionRegistry>,
        signals: mpsc::Sender<ChangeSignal>,
    ) -> Self {
        Self {
            interval,
            registry,
            signals,
            running: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock().is_some()
    }

    /// 启动轮询；已在运行时返回 false
    pub fn start(&self) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(poll_loop(
            self.interval,
            self.registry.clone(),
            self.signals.clone(),
            cancel.clone(),
        ));
        *running = Some(Running { cancel, task });

        info!(interval_ms = self.interval.as_millis() as u64, "Poll signal started");
        true
    }

    /// 停止轮询；未运行时返回 false
    pub async fn stop(&self) -> bool {
        let Some(running) = self.lock().take() else {
            return false;
        };

        running.cancel.cancel();
        let _ = running.task.await;
        info!("Poll signal stopped");
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn poll_loop(
    period: Duration,
    registry: Arc<SubscriptionRegistry>,
    signals: mpsc::Sender<ChangeSignal>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !registry.has_subscribers().await {
            continue;
        }

        debug!("Poll tick");
        tokio::select! {
            _ = cancel.cancelled() => break,
            result = signals.send(ChangeSignal::undirected(SignalOrigin::Poll)) => {
                if result.is_err() {
                    debug!("Signal receiver dropped, poll loop exiting");
                    break;
                }
            }
        }
    }
}
