//! 实时推送链路装配
//!
//! 访问器队列 → 推送通道 / 轮询 → 监督器 → 去重广播 → 订阅注册表 → 网关

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::accessor::{AccessorQueue, ChatAccessor};
use crate::config::LiveAppConfig;
use crate::error::Result;
use crate::gateway::{GatewayState, build_router};
use crate::signal::{
    LiveMode, PipeBackoff, PipeConnector, PipeSignal, PollSignal, SignalSupervisor,
    SupervisorHandle,
};

const SIGNAL_BUFFER: usize = 256;

/// 运行中的实时推送链路
pub struct LivePipeline {
    state: GatewayState,
    supervisor: SupervisorHandle,
    cancel: CancellationToken,
    broadcaster_task: Mutex<Option<JoinHandle<()>>>,
}

impl LivePipeline {
    /// 装配并启动全部组件，需在 tokio 运行时内调用
    pub fn start(
        accessor: Box<dyn ChatAccessor>,
        connector: Arc<dyn PipeConnector>,
        config: &LiveAppConfig,
    ) -> Result<Self> {
        config.validate()?;
        let handle = AccessorQueue::spawn(accessor)?;

        let (_, initial_mode) = watch::channel(LiveMode::Starting);
        let mut state = GatewayState::build(handle.clone(), config, initial_mode);

        let (signal_tx, signal_rx) = mpsc::channel(SIGNAL_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(SIGNAL_BUFFER);

        let endpoint = connector.endpoint();
        let pipe = PipeSignal::new(
            handle,
            connector,
            PipeBackoff::from_config(&config.pipe),
            event_tx,
        );
        let poll = PollSignal::new(
            Duration::from_millis(config.live.poll_interval_ms),
            state.registry.clone(),
            signal_tx.clone(),
        );

        let cancel = CancellationToken::new();
        let broadcaster_task = tokio::spawn(state.broadcaster.clone().run(signal_rx, cancel.clone()));

        let supervisor = SignalSupervisor::new(
            pipe,
            event_rx,
            poll,
            signal_tx,
            Duration::from_millis(config.live.push_confirm_timeout_ms),
        )
        .start();
        state.mode = supervisor.watch_mode();

        info!(
            endpoint = %endpoint,
            fetch_limit = config.live.fetch_limit,
            poll_interval_ms = config.live.poll_interval_ms,
            "Live pipeline started"
        );

        Ok(Self {
            state,
            supervisor,
            cancel,
            broadcaster_task: Mutex::new(Some(broadcaster_task)),
        })
    }

    pub fn state(&self) -> &GatewayState {
        &self.state
    }

    pub fn mode(&self) -> LiveMode {
        self.supervisor.mode()
    }

    pub fn watch_mode(&self) -> watch::Receiver<LiveMode> {
        self.supervisor.watch_mode()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// 停止信号源和广播器；可重复调用
    pub async fn stop(&self) {
        self.supervisor.stop().await;
        self.cancel.cancel();
        if let Some(task) = self.broadcaster_task.lock().await.take() {
            if let Err(e) = task.await {
                debug!(error = %e, "Broadcaster task ended abnormally");
            }
        }
        info!("Live pipeline stopped");
    }
}
