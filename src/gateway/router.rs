//! HTTP / WebSocket 路由
//!
//! - `GET /ws`：订阅连接
//! - `GET /health`：存活与当前信号模式
//! - `GET /metrics`：Prometheus 文本格式
//! - `GET /api/v1/messages`：历史消息
//! - `GET /api/v1/sessions`：会话列表

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::connection::handle_socket;
use crate::accessor::{AccessorError, AccessorHandle};
use crate::config::LiveAppConfig;
use crate::error::LiveError;
use crate::history::{HistoryQuery, HistoryService};
use crate::live::{DedupBroadcaster, IncrementalFetcher, SubscriptionRegistry};
use crate::metrics::gather_metrics;
use crate::signal::LiveMode;

/// 路由共享状态
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Arc<SubscriptionRegistry>,
    pub broadcaster: Arc<DedupBroadcaster>,
    pub accessor: AccessorHandle,
    pub history: HistoryService,
    pub mode: watch::Receiver<LiveMode>,
}

impl GatewayState {
    /// 基于访问器句柄组装注册表、广播器和历史查询
    pub fn build(
        accessor: AccessorHandle,
        config: &LiveAppConfig,
        mode: watch::Receiver<LiveMode>,
    ) -> Self {
        let self_id = config.accessor.self_id.clone();
        let registry = Arc::new(SubscriptionRegistry::new(config.live.event_buffer));
        let fetcher = IncrementalFetcher::new(accessor.clone(), config.live.fetch_limit, self_id.clone());
        let broadcaster = Arc::new(DedupBroadcaster::new(
            fetcher,
            accessor.clone(),
            registry.clone(),
            &config.live,
        ));
        let history = HistoryService::new(accessor.clone(), self_id, config.history.clone());

        Self {
            registry,
            broadcaster,
            accessor,
            history,
            mode,
        }
    }
}

/// 构建网关路由
pub fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/messages", get(messages))
        .route("/api/v1/sessions", get(sessions))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<GatewayState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn health(State(state): State<GatewayState>) -> impl IntoResponse {
    let stats = state.registry.stats().await;
    let mode = *state.mode.borrow();
    Json(json!({
        "status": "ok",
        "mode": mode,
        "connections": stats.connections,
        "subscribedDestinations": stats.subscribed_destinations,
        "wildcardSubscribers": stats.wildcard_subscribers,
    }))
}

async fn metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}

#[derive(Debug, Deserialize)]
struct MessagesParams {
    talker: Option<String>,
    limit: Option<String>,
    start: Option<String>,
    end: Option<String>,
}

async fn messages(
    State(state): State<GatewayState>,
    Query(params): Query<MessagesParams>,
) -> Result<impl IntoResponse, LiveError> {
    let limit = match params.limit.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
        None => None,
        Some(v) => Some(
            v.parse::<usize>()
                .map_err(|_| LiveError::Protocol(format!("invalid limit: {}", v)))?,
        ),
    };

    let query = HistoryQuery {
        talker: params.talker.unwrap_or_default(),
        limit,
        start: params.start,
        end: params.end,
    };
    let page = state.history.messages(&query).await?;
    Ok(Json(page))
}

async fn sessions(State(state): State<GatewayState>) -> Result<impl IntoResponse, LiveError> {
    let sessions = state.history.sessions().await?;
    Ok(Json(json!({ "count": sessions.len(), "sessions": sessions })))
}

impl IntoResponse for LiveError {
    fn into_response(self) -> Response {
        let status = match &self {
            LiveError::Protocol(_) => StatusCode::BAD_REQUEST,
            LiveError::UnknownDestination(_)
            | LiveError::Accessor(AccessorError::UnknownDestination(_)) => StatusCode::NOT_FOUND,
            LiveError::Accessor(_) => StatusCode::SERVICE_UNAVAILABLE,
            LiveError::Config(_) | LiveError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        let cases = [
            (LiveError::Protocol("x".into()), StatusCode::BAD_REQUEST),
            (LiveError::UnknownDestination("x".into()), StatusCode::NOT_FOUND),
            (
                LiveError::Accessor(AccessorError::UnknownDestination("x".into())),
                StatusCode::NOT_FOUND,
            ),
            (
                LiveError::Accessor(AccessorError::QueueClosed),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }
}
