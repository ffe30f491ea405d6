//! WebSocket transport: connection registry and per-socket lifecycle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use crossbar_core::rpc::{RpcRequest, RpcResponse};
use crossbar_core::{ConnectionId, Transport};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dispatcher::ApiDispatcher;
use crate::subscriptions::SubscriptionManager;

/// A connected WebSocket client.
pub struct Connection {
    pub id: ConnectionId,
    tx: mpsc::Sender<String>,
    connected: AtomicBool,
    /// Authenticated principal, if an auth layer set one.
    principal: Mutex<Option<String>>,
    /// Count of messages dropped due to a full send queue.
    dropped_messages: AtomicU64,
}

impl Connection {
    fn new(id: ConnectionId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            tx,
            connected: AtomicBool::new(true),
            principal: Mutex::new(None),
            dropped_messages: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn set_principal(&self, principal: Option<String>) {
        *self.principal.lock() = principal;
    }

    pub fn principal(&self) -> Option<String> {
        self.principal.lock().clone()
    }

    /// Queue a text message without blocking. Returns `false` and counts a
    /// drop when the queue is full or the client is gone.
    pub fn send(&self, message: String) -> bool {
        if self.tx.try_send(message).is_ok() {
            true
        } else {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }
}

/// Registry of live WebSocket connections.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    max_send_queue: usize,
}

impl ConnectionRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            connections: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new connection and return its id plus the receive side of
    /// its send queue.
    pub fn register(&self) -> (ConnectionId, mpsc::Receiver<String>) {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let connection = Arc::new(Connection::new(id.clone(), tx));
        let _ = self.connections.insert(id.clone(), connection);
        (id, rx)
    }

    pub fn unregister(&self, id: &ConnectionId) {
        if let Some((_, connection)) = self.connections.remove(id) {
            connection.connected.store(false, Ordering::Relaxed);
        }
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    /// Send to one connection; failures are the caller's to log.
    pub fn send_to(&self, id: &ConnectionId, message: String) -> bool {
        match self.connections.get(id) {
            Some(connection) => connection.send(message),
            None => false,
        }
    }

    /// Fan a message out to every live connection. Each recipient gets an
    /// independent non-blocking queue push; one slow client never delays the
    /// others. Returns the number of failed deliveries.
    pub fn broadcast(&self, message: &str) -> usize {
        let mut failed = 0;
        for entry in self.connections.iter() {
            let connection = entry.value();
            if connection.is_connected() && !connection.send(message.to_string()) {
                warn!(conn_id = %connection.id, "send queue full, dropped broadcast message");
                failed += 1;
            }
        }
        failed
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

/// Handle one WebSocket for its lifetime: a writer task drains the send
/// queue and pings on the heartbeat interval, the reader dispatches each
/// inbound request on its own task. On exit the connection and its
/// subscription state are torn down.
pub async fn handle_ws_connection(
    socket: WebSocket,
    connection_id: ConnectionId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<ApiDispatcher>,
    subscriptions: Arc<SubscriptionManager>,
    heartbeat_interval: Duration,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(axum::body::Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let reader_id = connection_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_inbound(
                        text.to_string(),
                        reader_id.clone(),
                        Arc::clone(&reader_registry),
                        Arc::clone(&dispatcher),
                    );
                }
                WsMessage::Close(_) => break,
                // axum answers Ping with Pong automatically.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&connection_id);
    subscriptions.on_disconnect(&connection_id).await;
    info!(conn_id = %connection_id, "websocket client disconnected");
}

/// Decode one inbound frame and dispatch it on its own task so concurrent
/// requests from the same client never serialize behind each other.
fn handle_inbound(
    raw: String,
    connection_id: ConnectionId,
    registry: Arc<ConnectionRegistry>,
    dispatcher: Arc<ApiDispatcher>,
) {
    let request: RpcRequest = match serde_json::from_str(&raw) {
        Ok(req) => req,
        Err(e) => {
            debug!(conn_id = %connection_id, error = %e, "unparseable request frame");
            if let Ok(json) = serde_json::to_string(&RpcResponse::parse_error()) {
                let _ = registry.send_to(&connection_id, json);
            }
            return;
        }
    };

    tokio::spawn(async move {
        let response = dispatcher
            .dispatch_rpc(request, Transport::Ws, Some(connection_id.clone()))
            .await;
        if let Some(response) = response {
            match serde_json::to_string(&response) {
                Ok(json) => {
                    // The client may be gone by the time a handler finishes;
                    // its result is simply discarded.
                    let _ = registry.send_to(&connection_id, json);
                }
                Err(e) => warn!(conn_id = %connection_id, error = %e, "failed to serialize response"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn send_to_delivers() {
        let registry = ConnectionRegistry::new(32);
        let (id, mut rx) = registry.register();

        assert!(registry.send_to(&id, "hello".into()));
        assert_eq!(rx.recv().await.unwrap(), "hello");
    }

    #[test]
    fn send_to_unknown_connection() {
        let registry = ConnectionRegistry::new(32);
        assert!(!registry.send_to(&ConnectionId::new(), "hello".into()));
    }

    #[tokio::test]
    async fn full_queue_drops_and_counts() {
        let registry = ConnectionRegistry::new(1);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "first".into()));
        assert!(!registry.send_to(&id, "second".into()));
        assert_eq!(registry.get(&id).unwrap().drop_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_all_connections() {
        let registry = ConnectionRegistry::new(32);
        let (_id1, mut rx1) = registry.register();
        let (_id2, mut rx2) = registry.register();

        let failed = registry.broadcast("ping");
        assert_eq!(failed, 0);
        assert_eq!(rx1.recv().await.unwrap(), "ping");
        assert_eq!(rx2.recv().await.unwrap(), "ping");
    }

    #[tokio::test]
    async fn slow_receiver_does_not_block_others() {
        let registry = ConnectionRegistry::new(1);
        let (slow_id, _slow_rx) = registry.register();
        let (_fast_id, mut fast_rx) = registry.register();

        // Fill the slow client's queue.
        assert!(registry.send_to(&slow_id, "backlog".into()));

        let failed = registry.broadcast("update");
        assert_eq!(failed, 1);
        // The fast client still got both its own copy.
        assert_eq!(fast_rx.recv().await.unwrap(), "update");
    }

    #[test]
    fn principal_defaults_to_none() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register();
        let connection = registry.get(&id).unwrap();
        assert!(connection.principal().is_none());

        connection.set_principal(Some("operator".into()));
        assert_eq!(connection.principal().as_deref(), Some("operator"));
    }

    #[test]
    fn unregister_marks_disconnected() {
        let registry = ConnectionRegistry::new(8);
        let (id, _rx) = registry.register();
        let connection = registry.get(&id).unwrap();
        assert!(connection.is_connected());

        registry.unregister(&id);
        assert!(!connection.is_connected());
        assert!(registry.get(&id).is_none());
    }
}
