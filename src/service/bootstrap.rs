//! 应用启动器 - 负责依赖注入和服务启动
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tracing::{info, warn};

use super::wire::LivePipeline;
use crate::accessor::{ChatAccessor, MemoryAccessor};
use crate::config::LiveAppConfig;
use crate::signal::{DisabledConnector, PipeConnector, default_connector};

/// 应用上下文 - 包含已启动的实时推送链路
pub struct ApplicationContext {
    pub pipeline: LivePipeline,
}

/// 应用启动器
pub struct ApplicationBootstrap;

impl ApplicationBootstrap {
    /// 运行应用的主入口点
    pub async fn run(config: &'static LiveAppConfig) -> Result<()> {
        let context = Self::create_context(config)?;
        Self::start_server(context, &config.server.bind_addr()).await
    }

    /// 创建应用上下文
    pub fn create_context(config: &LiveAppConfig) -> Result<ApplicationContext> {
        let accessor = Self::build_accessor(config)?;
        let connector = Self::build_connector(config);
        let pipeline = LivePipeline::start(accessor, connector, config)
            .context("failed to start live pipeline")?;
        Ok(ApplicationContext { pipeline })
    }

    fn build_accessor(config: &LiveAppConfig) -> Result<Box<dyn ChatAccessor>> {
        match config.accessor.snapshot_path.as_deref() {
            Some(path) => {
                let accessor = MemoryAccessor::load_snapshot(path)?;
                info!(path = %path, "Loaded archive snapshot");
                Ok(Box::new(accessor))
            }
            None => {
                warn!("No snapshot configured, serving an empty archive");
                Ok(Box::new(MemoryAccessor::new()))
            }
        }
    }

    fn build_connector(config: &LiveAppConfig) -> Arc<dyn PipeConnector> {
        match config.accessor.pipe_path.as_deref() {
            Some(path) => default_connector(path),
            None => {
                warn!("No push channel endpoint configured, relying on poll fallback");
                Arc::new(DisabledConnector)
            }
        }
    }

    /// 启动 HTTP / WebSocket 服务器
    pub async fn start_server(context: ApplicationContext, addr: &str) -> Result<()> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(%addr, "starting chatlog live service");

        let router = context.pipeline.router();
        let result = axum::serve(listener, router)
            .with_graceful_shutdown(async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!(error = %e, "failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                info!("shutdown signal received");
            })
            .await;

        if let Err(err) = &result {
            tracing::error!(error = %err, "chatlog live service failed");
        }

        Self::graceful_shutdown(context).await;
        info!("chatlog live service stopped");
        result.map_err(Into::into)
    }

    /// 优雅停机处理
    async fn graceful_shutdown(context: ApplicationContext) {
        context.pipeline.stop().await;
    }
}
