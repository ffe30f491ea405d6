//! Bridges bus events to client-facing JSON-RPC notifications.

use std::sync::Arc;

use crossbar_core::rpc::RpcNotification;
use crossbar_core::ConnectionId;
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::events::{event_description, EventBus};
use crate::transport::ws::ConnectionRegistry;

/// Outbound broker sink: payloads pushed here are published on the response
/// topic by the MQTT transport task.
struct MqttSink {
    tx: mpsc::Sender<String>,
}

/// Subscribes to bus events and fans notifications out to every connected
/// socket client and, when the broker transport is up, to the response
/// topic. Delivery is best-effort and independent per recipient.
pub struct NotificationBridge {
    events: Arc<EventBus>,
    connections: Arc<ConnectionRegistry>,
    mqtt: RwLock<Option<MqttSink>>,
}

impl NotificationBridge {
    pub fn new(events: Arc<EventBus>, connections: Arc<ConnectionRegistry>) -> Self {
        Self {
            events,
            connections,
            mqtt: RwLock::new(None),
        }
    }

    /// Attach the broker sink once the MQTT transport has connected.
    pub fn attach_mqtt(&self, tx: mpsc::Sender<String>) {
        *self.mqtt.write() = Some(MqttSink { tx });
    }

    /// Subscribe to `event` on the bus and broadcast it as a notification.
    /// The method name defaults to `notify_` plus the description part of
    /// the event name (`server:ready` becomes `notify_ready`).
    pub fn register_notification(self: &Arc<Self>, event: &str, notify_name: Option<&str>) {
        let method = match notify_name {
            Some(name) => name.to_string(),
            None => format!("notify_{}", event_description(event)),
        };
        let bridge = Arc::clone(self);
        self.events.register_event_handler(event, move |args| {
            let bridge = Arc::clone(&bridge);
            let method = method.clone();
            async move {
                bridge.broadcast(&method, args.to_vec());
                Ok(())
            }
        });
    }

    /// Broadcast a notification to all socket clients and the broker.
    pub fn broadcast(&self, method: &str, params: Vec<Value>) {
        let Some(json) = encode(method, params) else {
            return;
        };
        let failed = self.connections.broadcast(&json);
        if failed > 0 {
            debug!(method, failed, "notification dropped for slow connections");
        }
        self.publish_mqtt(&json);
    }

    /// Deliver a notification to one specific connection. The broker
    /// pseudo-connection routes to the response topic.
    pub fn send_to(&self, connection: &ConnectionId, method: &str, params: Vec<Value>) {
        let Some(json) = encode(method, params) else {
            return;
        };
        if *connection == ConnectionId::mqtt() {
            self.publish_mqtt(&json);
        } else if !self.connections.send_to(connection, json) {
            debug!(conn_id = %connection, method, "notification dropped, connection gone or backlogged");
        }
    }

    fn publish_mqtt(&self, json: &str) {
        let mqtt = self.mqtt.read();
        if let Some(sink) = mqtt.as_ref() {
            if sink.tx.try_send(json.to_string()).is_err() {
                warn!("mqtt publish queue full, dropped notification");
            }
        }
    }
}

fn encode(method: &str, params: Vec<Value>) -> Option<String> {
    match serde_json::to_string(&RpcNotification::new(method, params)) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!(method, error = %e, "failed to serialize notification");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn setup() -> (Arc<EventBus>, Arc<ConnectionRegistry>, Arc<NotificationBridge>) {
        let events = Arc::new(EventBus::new());
        let connections = Arc::new(ConnectionRegistry::new(32));
        let bridge = Arc::new(NotificationBridge::new(
            Arc::clone(&events),
            Arc::clone(&connections),
        ));
        (events, connections, bridge)
    }

    #[tokio::test]
    async fn derived_method_name_from_event() {
        let (events, connections, bridge) = setup();
        let (_id, mut rx) = connections.register();

        bridge.register_notification("machine:state_changed", None);
        events
            .send_event_and_wait("machine:state_changed", vec![json!("printing")])
            .await;

        let raw = rx.recv().await.unwrap();
        let wire: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(wire["jsonrpc"], "2.0");
        assert_eq!(wire["method"], "notify_state_changed");
        assert_eq!(wire["params"], json!(["printing"]));
        assert!(wire.get("id").is_none());
    }

    #[tokio::test]
    async fn explicit_override_wins() {
        let (events, connections, bridge) = setup();
        let (_id, mut rx) = connections.register();

        bridge.register_notification("server:ready", Some("notify_server_online"));
        events.send_event_and_wait("server:ready", vec![]).await;

        let wire: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(wire["method"], "notify_server_online");
    }

    #[tokio::test]
    async fn every_connection_receives_broadcast() {
        let (_events, connections, bridge) = setup();
        let (_a, mut rx_a) = connections.register();
        let (_b, mut rx_b) = connections.register();

        bridge.broadcast("notify_ready", vec![]);

        assert!(rx_a.recv().await.is_some());
        assert!(rx_b.recv().await.is_some());
    }

    #[tokio::test]
    async fn backlogged_connection_does_not_block_delivery() {
        let (_events, connections, bridge) = setup();
        // Queue depth 32; saturate one client.
        let (stuck_id, _stuck_rx) = connections.register();
        for _ in 0..32 {
            connections.send_to(&stuck_id, "backlog".into());
        }
        let (_ok_id, mut ok_rx) = connections.register();

        bridge.broadcast("notify_ready", vec![json!(1)]);
        let wire: Value = serde_json::from_str(&ok_rx.recv().await.unwrap()).unwrap();
        assert_eq!(wire["method"], "notify_ready");
    }

    #[tokio::test]
    async fn targeted_send_reaches_only_target() {
        let (_events, connections, bridge) = setup();
        let (id_a, mut rx_a) = connections.register();
        let (_id_b, mut rx_b) = connections.register();

        bridge.send_to(&id_a, "notify_status_update", vec![json!({"x": 1}), json!(5.0)]);

        let wire: Value = serde_json::from_str(&rx_a.recv().await.unwrap()).unwrap();
        assert_eq!(wire["method"], "notify_status_update");
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn mqtt_sink_receives_broadcasts_when_attached() {
        let (_events, _connections, bridge) = setup();
        let (tx, mut rx) = mpsc::channel(8);
        bridge.attach_mqtt(tx);

        bridge.broadcast("notify_ready", vec![]);
        let wire: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(wire["method"], "notify_ready");

        // The broker pseudo-connection routes targeted sends to the sink too.
        bridge.send_to(&ConnectionId::mqtt(), "notify_status_update", vec![]);
        let wire: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(wire["method"], "notify_status_update");
    }

    #[tokio::test]
    async fn send_to_dead_connection_is_silent() {
        let (_events, connections, bridge) = setup();
        let (id, rx) = connections.register();
        drop(rx);
        connections.unregister(&id);

        // Must not panic or error.
        bridge.send_to(&id, "notify_ready", vec![]);
    }
}
