//! 订阅管理
//!
//! 记录每个连接关心的会话（或通配订阅），并把新消息投递到连接的发送队列。
//! 连接关闭时订阅随之销毁；广播器只查询，不持有订阅。

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::domain::DecodedMessage;
use crate::metrics::LIVE_METRICS;

/// 推送给订阅者的新消息事件
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessageEvent {
    pub destination: String,
    pub message: DecodedMessage,
    /// 发布时间（毫秒）
    pub timestamp: i64,
}

/// 连接的订阅
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    /// 通配订阅
    pub all: bool,
    pub destinations: BTreeSet<String>,
}

impl Subscription {
    pub fn is_interested(&self, destination: &str) -> bool {
        self.all || self.destinations.contains(destination)
    }

    pub fn is_empty(&self) -> bool {
        !self.all && self.destinations.is_empty()
    }
}

struct ConnectionEntry {
    sender: mpsc::Sender<NewMessageEvent>,
    subscription: Subscription,
    connected_at: DateTime<Utc>,
}

/// 订阅统计
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStats {
    pub connections: usize,
    pub wildcard_subscribers: usize,
    pub subscribed_destinations: usize,
}

/// 订阅注册表
pub struct SubscriptionRegistry {
    /// 连接映射：connection_id -> 连接
    connections: Arc<RwLock<HashMap<String, ConnectionEntry>>>,
    /// 会话订阅者映射：destination -> connection_ids
    destination_subscribers: Arc<RwLock<HashMap<String, HashSet<String>>>>,
    buffer: usize,
}

impl SubscriptionRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            destination_subscribers: Arc::new(RwLock::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// 注册连接，返回该连接的事件接收端
    pub async fn register(&self, connection_id: &str) -> mpsc::Receiver<NewMessageEvent> {
        let (sender, receiver) = mpsc::channel(self.buffer);
        let mut connections = self.connections.write().await;
        connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                sender,
                subscription: Subscription::default(),
                connected_at: Utc::now(),
            },
        );
        LIVE_METRICS.connections_active.set(connections.len() as i64);

        info!(connection_id = %connection_id, "Subscriber connected");
        receiver
    }

    /// 注销连接并清理全部订阅
    pub async fn unregister(&self, connection_id: &str) {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.remove(connection_id) else {
            return;
        };
        LIVE_METRICS.connections_active.set(connections.len() as i64);
        drop(connections);

        let mut subscribers = self.destination_subscribers.write().await;
        for destination in &entry.subscription.destinations {
            remove_subscriber(&mut subscribers, destination, connection_id);
        }

        info!(
            connection_id = %connection_id,
            connected_secs = (Utc::now() - entry.connected_at).num_seconds(),
            "Subscriber disconnected"
        );
    }

    /// 订阅会话，返回本次新增后的完整会话列表
    pub async fn subscribe(&self, connection_id: &str, destinations: &[String]) -> Vec<String> {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(connection_id) else {
            warn!(connection_id = %connection_id, "Subscribe from unknown connection");
            return Vec::new();
        };

        let mut subscribers = self.destination_subscribers.write().await;
        for destination in destinations {
            entry.subscription.destinations.insert(destination.clone());
            subscribers
                .entry(destination.clone())
                .or_default()
                .insert(connection_id.to_string());
        }

        debug!(
            connection_id = %connection_id,
            count = destinations.len(),
            "Subscribed to {} destinations",
            destinations.len()
        );
        entry.subscription.destinations.iter().cloned().collect()
    }

    /// 通配订阅
    pub async fn subscribe_all(&self, connection_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(entry) => {
                entry.subscription.all = true;
                info!(connection_id = %connection_id, "Subscribed to all destinations");
                true
            }
            None => false,
        }
    }

    /// 取消订阅；`destinations` 为 None 时取消全部（含通配），返回被取消的会话
    pub async fn unsubscribe(
        &self,
        connection_id: &str,
        destinations: Option<&[String]>,
    ) -> Vec<String> {
        let mut connections = self.connections.write().await;
        let Some(entry) = connections.get_mut(connection_id) else {
            return Vec::new();
        };

        let removed: Vec<String> = match destinations {
            Some(list) => list
                .iter()
                .filter(|d| entry.subscription.destinations.remove(d.as_str()))
                .cloned()
                .collect(),
            None => {
                entry.subscription.all = false;
                std::mem::take(&mut entry.subscription.destinations)
                    .into_iter()
                    .collect()
            }
        };

        let mut subscribers = self.destination_subscribers.write().await;
        for destination in &removed {
            remove_subscriber(&mut subscribers, destination, connection_id);
        }

        debug!(
            connection_id = %connection_id,
            count = removed.len(),
            "Unsubscribed from {} destinations",
            removed.len()
        );
        removed
    }

    pub async fn subscription(&self, connection_id: &str) -> Option<Subscription> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|entry| entry.subscription.clone())
    }

    /// 是否存在任意有效订阅
    pub async fn has_subscribers(&self) -> bool {
        self.connections
            .read()
            .await
            .values()
            .any(|entry| !entry.subscription.is_empty())
    }

    /// 是否存在通配订阅
    pub async fn has_wildcard(&self) -> bool {
        self.connections.read().await.values().any(|entry| entry.subscription.all)
    }

    /// 被显式订阅的会话
    pub async fn subscribed_destinations(&self) -> Vec<String> {
        let mut list: Vec<String> = self.destination_subscribers.read().await.keys().cloned().collect();
        list.sort();
        list
    }

    /// 是否有连接关心该会话
    pub async fn is_interested(&self, destination: &str) -> bool {
        if self.has_wildcard().await {
            return true;
        }
        self.destination_subscribers
            .read()
            .await
            .get(destination)
            .is_some_and(|ids| !ids.is_empty())
    }

    /// 向关心该会话的连接投递一条新消息，返回投递成功的连接数
    pub async fn publish(&self, destination: &str, message: &DecodedMessage) -> usize {
        let event = NewMessageEvent {
            destination: destination.to_string(),
            message: message.clone(),
            timestamp: Utc::now().timestamp_millis(),
        };

        let connections = self.connections.read().await;
        let mut delivered = 0;

        for (connection_id, entry) in connections.iter() {
            if !entry.subscription.is_interested(destination) {
                continue;
            }
            match entry.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(
                        connection_id = %connection_id,
                        destination = %destination,
                        "Subscriber queue full, dropping message"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection_id = %connection_id, "Subscriber queue closed");
                }
            }
        }

        delivered
    }

    pub async fn stats(&self) -> RegistryStats {
        let connections = self.connections.read().await;
        RegistryStats {
            connections: connections.len(),
            wildcard_subscribers: connections.values().filter(|e| e.subscription.all).count(),
            subscribed_destinations: self.destination_subscribers.read().await.len(),
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(256)
    }
}

fn remove_subscriber(
    subscribers: &mut HashMap<String, HashSet<String>>,
    destination: &str,
    connection_id: &str,
) {
    if let Some(ids) = subscribers.get_mut(destination) {
        ids.remove(connection_id);
        if ids.is_empty() {
            subscribers.remove(destination);
        }
    }
}
