//! 推送通道信号源
//!
//! 状态机：`Idle → Starting → Connecting → Connected → (Closed | Errored) → Idle`
//!
//! 1. 先让访问器关闭再重建推送通道（首轮也执行，清理上一个进程遗留的监听端），
//!    按 `channel_start_delays` 最多尝试 3 次；
//! 2. 成功后按退避连接，读取按行分隔的 JSON 通知并上报；
//! 3. 连接重试耗尽后上报 `Unavailable`，3 秒后整体重启（无上限）；
//!    重启轮次里通道创建也失败同样上报 `Unavailable`。
//!
//! `stop()` 幂等：取消所有等待、断开连接、关闭访问器通道，之后不再上报任何事件。

use std::sync::Arc;
use std::sync::Mutex;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::PipeBackoff;
use super::connector::{PipeConnector, PipeStream};
use super::PipeEvent;
use crate::accessor::{AccessorError, AccessorHandle};
use crate::metrics::LIVE_METRICS;

/// 推送通道状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeState {
    Idle,
    Starting,
    Connecting,
    Connected,
    Closed,
    /// 通道创建、连接或读取失败
    Errored,
}

/// 单条变更通知
#[derive(Debug, Deserialize)]
struct Notification {
    #[serde(default)]
    action: Option<String>,
    #[serde(default, alias = "talker", alias = "session", alias = "username")]
    destination: Option<String>,
}

/// 解析一行通知，格式错误返回 None
pub(crate) fn parse_notification(line: &str) -> Option<PipeEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let notification: Notification = serde_json::from_str(line).ok()?;
    Some(PipeEvent::Change {
        action: notification.action.unwrap_or_else(|| "change".to_string()),
        destination: notification
            .destination
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty()),
    })
}

enum ConnectOutcome {
    Cancelled,
    Exhausted,
}

enum ReadOutcome {
    Cancelled,
    Closed,
    Failed,
}

/// 推送通道信号源
pub struct PipeSignal {
    accessor: AccessorHandle,
    connector: Arc<dyn PipeConnector>,
    backoff: PipeBackoff,
    events: mpsc::Sender<PipeEvent>,
    state: watch::Sender<PipeState>,
    cancel: CancellationToken,
}

impl PipeSignal {
    pub fn new(
        accessor: AccessorHandle,
        connector: Arc<dyn PipeConnector>,
        backoff: PipeBackoff,
        events: mpsc::Sender<PipeEvent>,
    ) -> Self {
        let (state, _) = watch::channel(PipeState::Idle);
        Self {
            accessor,
            connector,
            backoff,
            events,
            state,
            cancel: CancellationToken::new(),
        }
    }

    /// 启动后台任务
    pub fn start(self) -> PipeSignalHandle {
        let cancel = self.cancel.clone();
        let state = self.state.subscribe();
        let accessor = self.accessor.clone();
        let task = tokio::spawn(self.run());

        PipeSignalHandle {
            cancel,
            state,
            accessor,
            task: Mutex::new(Some(task)),
        }
    }

    async fn run(self) {
        info!(endpoint = %self.connector.endpoint(), "Pipe signal starting");
        let mut restart_round = false;

        while !self.cancel.is_cancelled() {
            self.set_state(PipeState::Starting);

            match self.start_channel().await {
                Ok(()) => match self.connect_loop().await {
                    ConnectOutcome::Cancelled => break,
                    ConnectOutcome::Exhausted => {
                        warn!(
                            max_retries = self.backoff.max_connect_retries,
                            "Pipe connect retries exhausted, reporting unavailable"
                        );
                        self.emit(PipeEvent::Unavailable).await;
                    }
                },
                Err(e) => {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    self.set_state(PipeState::Errored);
                    warn!(error = %e, restart_round, "Failed to start change channel");
                    if restart_round {
                        self.emit(PipeEvent::Unavailable).await;
                    }
                }
            }

            self.set_state(PipeState::Idle);
            restart_round = true;

            let delay = self.backoff.restart_delay();
            debug!(delay_ms = delay.as_millis() as u64, "Scheduling pipe restart");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(PipeState::Idle);
        debug!("Pipe signal task exited");
    }

    /// 关闭并重建访问器推送通道
    async fn start_channel(&self) -> Result<(), AccessorError> {
        let mut last_error = AccessorError::ChannelUnavailable("no attempts configured".to_string());

        for (attempt, delay) in self.backoff.channel_start_delays().enumerate() {
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(AccessorError::ChannelUnavailable("cancelled".to_string())),
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.accessor.close_change_channel().await {
                debug!(error = %e, "Change channel cleanup failed");
            }

            match self.accessor.open_change_channel().await {
                Ok(()) => {
                    debug!(attempt = attempt + 1, "Change channel started");
                    return Ok(());
                }
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "Change channel start attempt failed");
                    LIVE_METRICS
                        .accessor_failures_total
                        .with_label_values(&["open_change_channel"])
                        .inc();
                    last_error = e;
                }
            }
        }

        Err(last_error)
    }

    /// 连接并读取，直到取消或重试耗尽
    async fn connect_loop(&self) -> ConnectOutcome {
        let mut failures: u32 = 0;
        let mut attempt: u32 = 0;

        loop {
            self.set_state(PipeState::Connecting);
            let delay = self.backoff.connect_delay(attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => return ConnectOutcome::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }

            if attempt > 0 {
                LIVE_METRICS.pipe_reconnects_total.inc();
            }

            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return ConnectOutcome::Cancelled,
                result = self.connector.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    info!(attempt = attempt + 1, "Pipe connected");
                    failures = 0;
                    self.set_state(PipeState::Connected);
                    self.emit(PipeEvent::Connected).await;

                    match self.read_notifications(stream).await {
                        ReadOutcome::Cancelled => return ConnectOutcome::Cancelled,
                        ReadOutcome::Closed => self.set_state(PipeState::Closed),
                        ReadOutcome::Failed => self.set_state(PipeState::Errored),
                    }
                    self.emit(PipeEvent::Disconnected).await;
                    // 断开后从第一次重连的间隔开始
                    attempt = 1;
                }
                Err(e) => {
                    self.set_state(PipeState::Errored);
                    failures += 1;
                    warn!(
                        attempt = attempt + 1,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Pipe connect failed"
                    );
                    if self.backoff.connect_exhausted(failures) {
                        return ConnectOutcome::Exhausted;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// 读取通知直到对端关闭、读取失败或取消
    async fn read_notifications(&self, stream: Box<dyn PipeStream>) -> ReadOutcome {
        let mut lines = BufReader::new(stream).lines();

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return ReadOutcome::Cancelled,
                next = lines.next_line() => next,
            };

            match next {
                Ok(Some(line)) => match parse_notification(&line) {
                    Some(event) => {
                        debug!(?event, "Pipe notification");
                        self.emit(event).await;
                    }
                    None if !line.trim().is_empty() => {
                        debug!(line = %line, "Ignoring malformed pipe notification");
                    }
                    None => {}
                },
                Ok(None) => {
                    info!("Pipe closed by peer");
                    return ReadOutcome::Closed;
                }
                Err(e) => {
                    warn!(error = %e, "Pipe read failed");
                    return ReadOutcome::Failed;
                }
            }
        }
    }

    async fn emit(&self, event: PipeEvent) {
        if self.cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            result = self.events.send(event) => {
                if result.is_err() {
                    debug!("Pipe event receiver dropped");
                }
            }
        }
    }

    fn set_state(&self, state: PipeState) {
        self.state.send_replace(state);
    }
}

/// 推送通道句柄
pub struct PipeSignalHandle {
    cancel: CancellationToken,
    state: watch::Receiver<PipeState>,
    accessor: AccessorHandle,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PipeSignalHandle {
    pub fn state(&self) -> PipeState {
        *self.state.borrow()
    }

    /// 停止推送通道（幂等）
    pub async fn stop(&self) {
        self.cancel.cancel();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let Some(task) = task else {
            return;
        };

        if let Err(e) = task.await {
            warn!(error = %e, "Pipe signal task ended abnormally");
        }

        if let Err(e) = self.accessor.close_change_channel().await {
            debug!(error = %e, "Failed to close change channel on stop");
        }
        info!("Pipe signal stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;
    use tokio::time::timeout;

    use super::*;
    use crate::accessor::{AccessorQueue, MemoryAccessor};
    use crate::signal::scripted::ScriptedConnector;

    const WAIT: Duration = Duration::from_secs(5);

    fn fast_backoff(connect_step_ms: u64) -> PipeBackoff {
        PipeBackoff {
            channel_start_delays_ms: vec![0, 5, 10],
            first_connect_delay_ms: 5,
            connect_step_ms,
            connect_delay_cap_ms: connect_step_ms * 4,
            max_connect_retries: 5,
            restart_delay_ms: 100,
        }
    }

    fn pipe_signal(
        memory: &MemoryAccessor,
        connector: Arc<ScriptedConnector>,
        backoff: PipeBackoff,
    ) -> (PipeSignal, mpsc::Receiver<PipeEvent>) {
        let handle = AccessorQueue::spawn(Box::new(memory.clone())).unwrap();
        let (tx, rx) = mpsc::channel(16);
        (PipeSignal::new(handle, connector, backoff, tx), rx)
    }

    #[tokio::test]
    async fn test_stop_closes_channel_and_silences_events() {
        let memory = MemoryAccessor::new();
        let connector = ScriptedConnector::new();
        let mut writer = connector.accept_next();
        let (signal, mut events) = pipe_signal(&memory, connector, fast_backoff(5));
        let pipe = signal.start();

        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(PipeEvent::Connected));
        assert_eq!(pipe.state(), PipeState::Connected);
        assert!(memory.channel_open());

        pipe.stop().await;
        pipe.stop().await;
        assert!(!memory.channel_open());
        assert_eq!(pipe.state(), PipeState::Idle);

        let _ = writer.write_all(b"{\"action\":\"change\",\"talker\":\"wxid_a\"}\n").await;
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_channel_start_failure_reports_unavailable_on_restart_round() {
        let memory = MemoryAccessor::new();
        memory.fail_channel_opens(6);
        let connector = ScriptedConnector::new();
        let _writer = connector.accept_next();
        let (signal, mut events) = pipe_signal(&memory, connector.clone(), fast_backoff(5));
        let pipe = signal.start();

        // 首轮 3 次失败不上报，重启轮次再失败 3 次才上报
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(PipeEvent::Unavailable));
        assert_eq!(memory.channel_open_calls(), 6);
        assert_eq!(connector.attempts(), 0);

        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(PipeEvent::Connected));
        assert_eq!(memory.channel_open_calls(), 7);

        pipe.stop().await;
    }

    #[tokio::test]
    async fn test_connect_failure_enters_errored_state() {
        let memory = MemoryAccessor::new();
        let connector = ScriptedConnector::new();
        let (signal, _events) = pipe_signal(&memory, connector.clone(), fast_backoff(200));
        let mut states = signal.state.subscribe();
        let pipe = signal.start();

        timeout(WAIT, states.wait_for(|state| *state == PipeState::Errored))
            .await
            .unwrap()
            .unwrap();
        assert!(connector.attempts() >= 1);

        pipe.stop().await;
        assert_eq!(pipe.state(), PipeState::Idle);
    }

    #[tokio::test]
    async fn test_peer_close_reports_disconnected() {
        let memory = MemoryAccessor::new();
        let connector = ScriptedConnector::new();
        let writer = connector.accept_next();
        let (signal, mut events) = pipe_signal(&memory, connector, fast_backoff(200));
        let pipe = signal.start();

        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(PipeEvent::Connected));
        drop(writer);
        assert_eq!(timeout(WAIT, events.recv()).await.unwrap(), Some(PipeEvent::Disconnected));
        assert_ne!(pipe.state(), PipeState::Connected);

        pipe.stop().await;
    }

    #[test]
    fn test_parse_notification_aliases() {
        assert_eq!(
            parse_notification(r#"{"action":"insert","talker":"wxid_a"}"#),
            Some(PipeEvent::Change {
                action: "insert".to_string(),
                destination: Some("wxid_a".to_string()),
            })
        );
        assert_eq!(
            parse_notification(r#"{"action":"update","session":"  "}"#),
            Some(PipeEvent::Change { action: "update".to_string(), destination: None })
        );
        assert_eq!(
            parse_notification(r#"{"destination":"1@chatroom"}"#),
            Some(PipeEvent::Change {
                action: "change".to_string(),
                destination: Some("1@chatroom".to_string()),
            })
        );
    }

    #[test]
    fn test_parse_notification_rejects_garbage() {
        assert_eq!(parse_notification("not json"), None);
        assert_eq!(parse_notification("   "), None);
        assert_eq!(parse_notification("[1,2]"), None);
    }
}
