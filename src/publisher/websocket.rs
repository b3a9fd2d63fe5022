//! WebSocket downstream-publish transport.
//!
//! Grounded in the teacher's `websocket::ConnectionManager` (a
//! `DashMap<id, Vec<(ConnectionId, Sender)>>` registry with an atomic
//! connection-id counter) and `websocket::handler::ws_handler` (the axum
//! upgrade + split send/receive task pair). Generalized here from
//! per-`user_id` delivery to per-`partitionKey` topic delivery: a
//! subscriber registers for `"*"` (everything) or a set of partition keys,
//! and every committed blotter is broadcast to whichever connections asked
//! for its partition (or for everything).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::Response;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::Publisher;
use crate::domain::SwapBlotter;
use crate::error::PstppError;

pub type ConnectionId = u64;
pub type WsSender = mpsc::UnboundedSender<PublishedBlotter>;

/// Wire shape of a broadcast message: the committed blotter plus enough of
/// the job's context for a subscriber to correlate it with its own request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishedBlotter {
    pub trade_id: String,
    pub partition_key: String,
    pub blotter: SwapBlotter,
}

struct Subscriber {
    conn_id: ConnectionId,
    tx: WsSender,
    /// `None` means "subscribed to every partition".
    topics: Option<std::collections::HashSet<String>>,
}

/// Registry of live WebSocket connections subscribed to downstream publish
/// traffic. One instance is shared between the publish stage and the `/ws`
/// upgrade handler.
pub struct ConnectionManager {
    subscribers: DashMap<ConnectionId, Subscriber>,
    next_conn_id: AtomicU64,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn add_connection(&self, tx: WsSender, topics: Option<Vec<String>>) -> ConnectionId {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(
            conn_id,
            Subscriber {
                conn_id,
                tx,
                topics: topics.map(|t| t.into_iter().collect()),
            },
        );
        tracing::info!(conn_id, "downstream publish subscriber connected");
        conn_id
    }

    pub fn remove_connection(&self, conn_id: ConnectionId) {
        self.subscribers.remove(&conn_id);
        tracing::info!(conn_id, "downstream publish subscriber disconnected");
    }

    /// Broadcast a committed blotter to every subscriber interested in its
    /// partition. At-least-once, best-effort: a send to a dead channel is
    /// logged and skipped, never retried here (the pipeline's own commit is
    /// already durable by the time this runs).
    pub fn broadcast(&self, partition_key: &str, message: PublishedBlotter) {
        let mut delivered = 0usize;
        for entry in self.subscribers.iter() {
            let sub = entry.value();
            let wants_it = sub
                .topics
                .as_ref()
                .is_none_or(|topics| topics.contains(partition_key));
            if !wants_it {
                continue;
            }
            if sub.tx.send(message.clone()).is_err() {
                tracing::debug!(conn_id = sub.conn_id, "subscriber channel closed, skipping");
                continue;
            }
            delivered += 1;
        }
        tracing::debug!(partition_key, delivered, "broadcast published blotter");
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }
}

/// [`Publisher`] backed by a [`ConnectionManager`] broadcast.
pub struct WsPublisher {
    manager: Arc<ConnectionManager>,
}

impl WsPublisher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl Publisher for WsPublisher {
    async fn publish(&self, blotter: &SwapBlotter) -> Result<(), PstppError> {
        self.manager.broadcast(
            &blotter.partition_key,
            PublishedBlotter {
                trade_id: blotter.trade_id.clone(),
                partition_key: blotter.partition_key.clone(),
                blotter: blotter.clone(),
            },
        );
        Ok(())
    }
}

/// Query parameters for the `/ws/trades` upgrade: an optional comma-separated
/// list of partition keys to filter on; absent means subscribe to all.
#[derive(Debug, Deserialize)]
pub struct WsSubscribeQuery {
    pub partitions: Option<String>,
}

/// Axum handler for the downstream-publish WebSocket endpoint.
pub async fn ws_publish_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsSubscribeQuery>,
    State(manager): State<Arc<ConnectionManager>>,
) -> Response {
    let topics = params
        .partitions
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).collect());
    ws.on_upgrade(move |socket| handle_socket(socket, manager, topics))
}

async fn handle_socket(socket: WebSocket, manager: Arc<ConnectionManager>, topics: Option<Vec<String>>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<PublishedBlotter>();
    let conn_id = manager.add_connection(tx, topics);

    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg)
                && sender.send(Message::Text(json.into())).await.is_err()
            {
                break;
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    manager.remove_connection(conn_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::trade_request::{Source, TradeRequest};

    fn sample_blotter() -> SwapBlotter {
        let req = TradeRequest::new(
            "T1".into(),
            "A_B_C".into(),
            None,
            None,
            None,
            Source::Api,
            serde_json::json!({"isin": "US0000000001"}),
            None,
        )
        .unwrap();
        SwapBlotter::from_request(&req)
    }

    #[tokio::test]
    async fn broadcast_delivers_only_to_matching_topic_subscribers() {
        let manager = ConnectionManager::new();
        let (tx_all, mut rx_all) = mpsc::unbounded_channel();
        let (tx_scoped, mut rx_scoped) = mpsc::unbounded_channel();
        let (tx_other, mut rx_other) = mpsc::unbounded_channel();

        manager.add_connection(tx_all, None);
        manager.add_connection(tx_scoped, Some(vec!["A_B_C".to_string()]));
        manager.add_connection(tx_other, Some(vec!["X_Y_Z".to_string()]));

        let blotter = sample_blotter();
        manager.broadcast(
            &blotter.partition_key,
            PublishedBlotter {
                trade_id: blotter.trade_id.clone(),
                partition_key: blotter.partition_key.clone(),
                blotter,
            },
        );

        assert!(rx_all.try_recv().is_ok());
        assert!(rx_scoped.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn publisher_never_fails_even_with_no_subscribers() {
        let manager = Arc::new(ConnectionManager::new());
        let publisher = WsPublisher::new(manager);
        assert!(publisher.publish(&sample_blotter()).await.is_ok());
    }

    #[tokio::test]
    async fn disconnecting_removes_from_registry() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let id = manager.add_connection(tx, None);
        assert_eq!(manager.connection_count(), 1);
        manager.remove_connection(id);
        assert_eq!(manager.connection_count(), 0);
    }
}
