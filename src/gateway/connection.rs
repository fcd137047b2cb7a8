//! 单个订阅连接
//!
//! 每条 WebSocket 连接一个循环：同时等待客户端帧和注册表投递的新消息事件。
//! 连接关闭（正常关闭、读写失败、投递通道关闭）时从注册表注销。

use std::collections::BTreeSet;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use super::protocol::{ClientCommand, ServerEvent, StatusPayload, WILDCARD, parse_command};
use super::router::GatewayState;
use crate::utils::{current_millis, new_connection_id};

/// 一条连接上的命令处理
pub struct ConnectionSession {
    connection_id: String,
    state: GatewayState,
}

impl ConnectionSession {
    pub fn new(connection_id: impl Into<String>, state: GatewayState) -> Self {
        Self {
            connection_id: connection_id.into(),
            state,
        }
    }

    /// 处理一条文本帧，返回需要回给客户端的事件（按顺序发送）
    pub async fn handle_text(&self, text: &str) -> Vec<ServerEvent> {
        match parse_command(text) {
            Ok(command) => self.handle_command(command).await,
            Err(e) => {
                debug!(connection_id = %self.connection_id, error = %e, "Rejected client frame");
                vec![ServerEvent::error(e.to_string())]
            }
        }
    }

    pub async fn handle_command(&self, command: ClientCommand) -> Vec<ServerEvent> {
        match command {
            ClientCommand::Subscribe { destinations } => self.subscribe(destinations).await,
            ClientCommand::SubscribeAll => vec![self.subscribe_all().await],
            ClientCommand::Unsubscribe { destinations } => self.unsubscribe(destinations).await,
            ClientCommand::Ping => vec![ServerEvent::Pong { timestamp: current_millis() }],
            ClientCommand::Status => vec![self.status().await],
        }
    }

    /// 未知会话报错，已知会话照常订阅
    async fn subscribe(&self, destinations: Vec<String>) -> Vec<ServerEvent> {
        let requested: BTreeSet<String> = destinations
            .into_iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
        if requested.is_empty() {
            return vec![ServerEvent::error("subscribe requires at least one destination")];
        }

        let known: BTreeSet<String> = match self.state.accessor.list_destinations().await {
            Ok(list) => list.into_iter().map(|info| info.destination).collect(),
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Failed to list destinations");
                return vec![ServerEvent::error(format!("destination lookup failed: {}", e))];
            }
        };

        let (accepted, unknown): (Vec<String>, Vec<String>) =
            requested.into_iter().partition(|d| known.contains(d));

        let mut replies = Vec::new();
        if !unknown.is_empty() {
            replies.push(ServerEvent::error(format!(
                "unknown destinations: {}",
                unknown.join(", ")
            )));
        }
        if accepted.is_empty() {
            return replies;
        }

        let subscribed = self.state.registry.subscribe(&self.connection_id, &accepted).await;

        // 订阅后立即建立基线，之后到达的第一条消息才会被判为新消息
        self.state.broadcaster.baseline_many(&accepted).await;

        replies.push(ServerEvent::Subscribed { destinations: subscribed });
        replies
    }

    /// 未订阅的会话报错，其余照常退订；不带列表时退订全部
    async fn unsubscribe(&self, destinations: Option<Vec<String>>) -> Vec<ServerEvent> {
        let requested: Option<Vec<String>> = destinations.map(|list| {
            list.into_iter()
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect()
        });

        let removed = self
            .state
            .registry
            .unsubscribe(&self.connection_id, requested.as_deref())
            .await;

        let mut replies = Vec::new();
        if let Some(requested) = &requested {
            let unknown: Vec<&str> = requested
                .iter()
                .filter(|d| !removed.contains(*d))
                .map(String::as_str)
                .collect();
            if !unknown.is_empty() {
                replies.push(ServerEvent::error(format!("not subscribed: {}", unknown.join(", "))));
            }
        }
        replies.push(ServerEvent::Unsubscribed { destinations: removed });
        replies
    }

    async fn subscribe_all(&self) -> ServerEvent {
        if !self.state.registry.subscribe_all(&self.connection_id).await {
            return ServerEvent::error("connection is not registered");
        }

        match self.state.broadcaster.sweep_targets().await {
            Ok(targets) => self.state.broadcaster.baseline_many(&targets).await,
            Err(e) => {
                warn!(connection_id = %self.connection_id, error = %e, "Failed to baseline wildcard targets");
            }
        }

        ServerEvent::Subscribed { destinations: vec![WILDCARD.to_string()] }
    }

    async fn status(&self) -> ServerEvent {
        let subscription = self
            .state
            .registry
            .subscription(&self.connection_id)
            .await
            .unwrap_or_default();
        let stats = self.state.registry.stats().await;

        ServerEvent::Status(StatusPayload {
            connection_id: self.connection_id.clone(),
            subscription,
            mode: *self.state.mode.borrow(),
            connections: stats.connections,
            baselined_destinations: self.state.broadcaster.baselined_count(),
        })
    }
}

/// 驱动一条 WebSocket 连接直到关闭
pub async fn handle_socket(socket: WebSocket, state: GatewayState) {
    let connection_id = new_connection_id();
    let registry = state.registry.clone();
    let mut events = registry.register(&connection_id).await;
    let session = ConnectionSession::new(connection_id.clone(), state);
    let (mut sink, mut stream) = socket.split();

    let hello = ServerEvent::Connected { connection_id: connection_id.clone() };
    if send_event(&mut sink, &hello).await.is_err() {
        registry.unregister(&connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            frame = stream.next() => {
                let replies = match frame {
                    Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        vec![ServerEvent::error("binary frames are not supported")]
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(connection_id = %connection_id, error = %e, "Socket read failed");
                        break;
                    }
                };
                if send_all(&mut sink, &replies).await.is_err() {
                    break;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut sink, &ServerEvent::NewMessage(event)).await.is_err() {
                    break;
                }
            }
        }
    }

    registry.unregister(&connection_id).await;
    let _ = sink.close().await;
}

async fn send_all<S>(sink: &mut S, events: &[ServerEvent]) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    for event in events {
        send_event(sink, event).await?;
    }
    Ok(())
}

async fn send_event<S>(sink: &mut S, event: &ServerEvent) -> Result<(), ()>
where
    S: futures::Sink<Message> + Unpin,
{
    let payload = match event.to_json() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(error = %e, "Failed to serialize server event");
            return Ok(());
        }
    };
    sink.send(Message::Text(payload.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{AccessorQueue, MemoryAccessor};
    use crate::config::LiveAppConfig;
    use crate::signal::LiveMode;

    async fn session(memory: &MemoryAccessor) -> (ConnectionSession, GatewayState) {
        let handle = AccessorQueue::spawn(Box::new(memory.clone())).unwrap();
        let (_tx, mode) = tokio::sync::watch::channel(LiveMode::Push);
        let state = GatewayState::build(handle, &LiveAppConfig::default(), mode);
        state.registry.register("c1").await;
        (ConnectionSession::new("c1", state.clone()), state)
    }

    #[tokio::test]
    async fn test_subscribe_known_destinations_baselines() {
        let memory = MemoryAccessor::new();
        memory.push_text("wxid_a", "wxid_a", "old", 1);
        let (session, state) = session(&memory).await;

        let replies = session
            .handle_text(r#"{"type":"subscribe","destinations":["wxid_a"]}"#)
            .await;
        assert_eq!(replies, vec![ServerEvent::Subscribed { destinations: vec!["wxid_a".into()] }]);
        assert_eq!(state.broadcaster.seen_len("wxid_a").await, Some(1));
    }

    #[tokio::test]
    async fn test_subscribe_unknown_destination_reports_error() {
        let memory = MemoryAccessor::new();
        memory.ensure_destination("wxid_a");
        let (session, state) = session(&memory).await;

        let replies = session
            .handle_text(r#"{"type":"subscribe","destinations":["ghost"]}"#)
            .await;
        assert_eq!(replies, vec![ServerEvent::error("unknown destinations: ghost")]);
        assert!(!state.registry.has_subscribers().await);

        let replies = session
            .handle_text(r#"{"type":"subscribe","destinations":["wxid_a","ghost"]}"#)
            .await;
        assert_eq!(
            replies,
            vec![
                ServerEvent::error("unknown destinations: ghost"),
                ServerEvent::Subscribed { destinations: vec!["wxid_a".into()] },
            ]
        );
        assert!(state.registry.is_interested("wxid_a").await);
    }

    #[tokio::test]
    async fn test_malformed_frames_keep_connection_usable() {
        let memory = MemoryAccessor::new();
        let (session, _state) = session(&memory).await;

        assert!(matches!(session.handle_text("{oops").await[..], [ServerEvent::Error { .. }]));
        assert!(matches!(session.handle_text(r#"{"type":"fly"}"#).await[..], [ServerEvent::Error { .. }]));
        assert!(matches!(session.handle_text(r#"{"type":"ping"}"#).await[..], [ServerEvent::Pong { .. }]));
    }

    #[tokio::test]
    async fn test_status_and_unsubscribe() {
        let memory = MemoryAccessor::new();
        memory.ensure_destination("wxid_a");
        let (session, _state) = session(&memory).await;

        session.handle_command(ClientCommand::SubscribeAll).await;
        session
            .handle_command(ClientCommand::Subscribe { destinations: vec!["wxid_a".into()] })
            .await;

        let replies = session.handle_command(ClientCommand::Status).await;
        let [ServerEvent::Status(status)] = &replies[..] else {
            panic!("expected status, got {:?}", replies);
        };
        assert_eq!(status.connection_id, "c1");
        assert!(status.subscription.all);
        assert_eq!(status.mode, LiveMode::Push);
        assert_eq!(status.connections, 1);

        let replies = session
            .handle_command(ClientCommand::Unsubscribe { destinations: None })
            .await;
        assert_eq!(replies, vec![ServerEvent::Unsubscribed { destinations: vec!["wxid_a".into()] }]);
    }

    #[tokio::test]
    async fn test_unsubscribe_reports_destinations_not_subscribed() {
        let memory = MemoryAccessor::new();
        memory.ensure_destination("wxid_a");
        memory.ensure_destination("wxid_b");
        let (session, state) = session(&memory).await;

        session
            .handle_command(ClientCommand::Subscribe {
                destinations: vec!["wxid_a".into(), "wxid_b".into()],
            })
            .await;

        let replies = session
            .handle_text(r#"{"type":"unsubscribe","destinations":["wxid_a","ghost"," wxid_a "]}"#)
            .await;
        assert_eq!(
            replies,
            vec![
                ServerEvent::error("not subscribed: ghost"),
                ServerEvent::Unsubscribed { destinations: vec!["wxid_a".into()] },
            ]
        );
        assert!(!state.registry.is_interested("wxid_a").await);
        assert!(state.registry.is_interested("wxid_b").await);
    }
}
