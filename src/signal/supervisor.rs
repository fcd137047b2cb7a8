//! 信号监督器
//!
//! - 启动推送通道；2 秒内没有确认连接则并行启动轮询（推送通道继续重试）
//! - 推送通道上报 `Unavailable` 时确保轮询在运行
//! - 已确认的连接断开后回到 `Starting`，重连在确认超时内没有成功则启动轮询
//! - 推送通道连接成功或收到变更通知时确保轮询停止
//!
//! 切换是电平触发的，重复的启停都是空操作。所有变更信号经由一个 mpsc 输出给广播器。

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::pipe::{PipeSignal, PipeSignalHandle};
use super::poll::PollSignal;
use super::{ChangeSignal, LiveMode, PipeEvent, SignalOrigin};
use crate::metrics::LIVE_METRICS;

/// 信号监督器
pub struct SignalSupervisor {
    pipe: PipeSignal,
    pipe_events: mpsc::Receiver<PipeEvent>,
    poll: PollSignal,
    signals: mpsc::Sender<ChangeSignal>,
    confirm_timeout: Duration,
}

impl SignalSupervisor {
    /// `pipe` 必须以 `pipe_events` 对应的发送端构造
    pub fn new(
        pipe: PipeSignal,
        pipe_events: mpsc::Receiver<PipeEvent>,
        poll: PollSignal,
        signals: mpsc::Sender<ChangeSignal>,
        confirm_timeout: Duration,
    ) -> Self {
        Self {
            pipe,
            pipe_events,
            poll,
            signals,
            confirm_timeout,
        }
    }

    /// 启动推送通道和监督任务
    pub fn start(self) -> SupervisorHandle {
        let SignalSupervisor {
            pipe,
            pipe_events,
            poll,
            signals,
            confirm_timeout,
        } = self;

        let cancel = CancellationToken::new();
        let (mode_tx, mode_rx) = watch::channel(LiveMode::Starting);
        LIVE_METRICS.record_mode(LiveMode::Starting.as_str());

        let supervision = Supervision {
            pipe: pipe.start(),
            pipe_events,
            poll,
            signals,
            confirm_timeout,
            mode: mode_tx,
        };
        let task = tokio::spawn(supervision.run(cancel.clone()));

        SupervisorHandle {
            cancel,
            mode: mode_rx,
            task: Mutex::new(Some(task)),
        }
    }
}

struct Supervision {
    pipe: PipeSignalHandle,
    pipe_events: mpsc::Receiver<PipeEvent>,
    poll: PollSignal,
    signals: mpsc::Sender<ChangeSignal>,
    confirm_timeout: Duration,
    mode: watch::Sender<LiveMode>,
}

impl Supervision {
    async fn run(mut self, cancel: CancellationToken) {
        let mut push_confirmed = false;

        let confirm = tokio::time::sleep(self.confirm_timeout);
        tokio::pin!(confirm);
        let mut confirm_pending = true;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = &mut confirm, if confirm_pending => {
                    confirm_pending = false;
                    if !push_confirmed {
                        warn!(
                            timeout_ms = self.confirm_timeout.as_millis() as u64,
                            pipe_state = ?self.pipe.state(),
                            "Push channel not confirmed, starting poll fallback"
                        );
                        self.ensure_poll();
                    }
                }
                event = self.pipe_events.recv() => {
                    let Some(event) = event else {
                        debug!("Pipe event channel closed");
                        break;
                    };
                    match event {
                        PipeEvent::Connected => {
                            push_confirmed = true;
                            self.ensure_push().await;
                        }
                        PipeEvent::Change { action, destination } => {
                            push_confirmed = true;
                            self.ensure_push().await;
                            debug!(action = %action, destination = ?destination, "Forwarding change");
                            let signal = ChangeSignal { destination, origin: SignalOrigin::Pipe };
                            if self.signals.send(signal).await.is_err() {
                                debug!("Signal receiver dropped");
                                break;
                            }
                        }
                        PipeEvent::Disconnected => {
                            push_confirmed = false;
                            info!(
                                timeout_ms = self.confirm_timeout.as_millis() as u64,
                                "Push channel disconnected, waiting for reconnect"
                            );
                            // 轮询已在运行时保持 Poll，否则等待重连确认
                            if !self.poll.is_running() {
                                set_mode(&self.mode, LiveMode::Starting);
                            }
                            confirm.as_mut().reset(Instant::now() + self.confirm_timeout);
                            confirm_pending = true;
                        }
                        PipeEvent::Unavailable => {
                            push_confirmed = false;
                            warn!("Push channel unavailable, ensuring poll fallback");
                            self.ensure_poll();
                        }
                    }
                }
            }
        }

        self.poll.stop().await;
        self.pipe.stop().await;
        set_mode(&self.mode, LiveMode::Stopped);
        info!("Signal supervisor stopped");
    }

    fn ensure_poll(&self) {
        self.poll.start();
        set_mode(&self.mode, LiveMode::Poll);
    }

    async fn ensure_push(&self) {
        if self.poll.stop().await {
            info!("Push channel active, poll fallback stopped");
        }
        set_mode(&self.mode, LiveMode::Push);
    }
}

fn set_mode(mode: &watch::Sender<LiveMode>, next: LiveMode) {
    let changed = mode.send_if_modified(|current| {
        if *current == next {
            false
        } else {
            *current = next;
            true
        }
    });

    if changed {
        info!(mode = %next, "Live mode changed");
        LIVE_METRICS.record_mode(next.as_str());
    }
}

/// 监督器句柄
pub struct SupervisorHandle {
    cancel: CancellationToken,
    mode: watch::Receiver<LiveMode>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SupervisorHandle {
    pub fn mode(&self) -> LiveMode {
        *self.mode.borrow()
    }

    /// 订阅模式变化
    pub fn watch_mode(&self) -> watch::Receiver<LiveMode> {
        self.mode.clone()
    }

    /// 停止监督器、轮询和推送通道（幂等）
    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Supervisor task ended abnormally");
            }
        }
    }
}
