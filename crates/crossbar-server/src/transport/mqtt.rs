//! Broker adapter: serves the RPC surface over MQTT.
//!
//! Requests arrive on `<instance>/api/request`; responses and broadcast
//! notifications go out on `<instance>/api/response`. The broker is modeled
//! as a single long-lived pseudo connection, so broker-side subscriptions
//! share one subscription record no matter how many MQTT clients listen.

use std::sync::Arc;
use std::time::Duration;

use crossbar_core::{ConnectionId, RpcRequest, RpcResponse, Transport};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::dispatcher::ApiDispatcher;
use crate::notify::NotificationBridge;

/// Connect to the broker and run the request/response loop until the server
/// shuts down. Returns once the connection task has been spawned.
pub fn start(
    config: MqttConfig,
    dispatcher: Arc<ApiDispatcher>,
    notify: Arc<NotificationBridge>,
) -> tokio::task::JoinHandle<()> {
    let mut options = MqttOptions::new(config.instance_name.clone(), config.host.clone(), config.port);
    let _ = options.set_keep_alive(Duration::from_secs(30));
    if let (Some(user), Some(pass)) = (config.username.clone(), config.password.clone()) {
        let _ = options.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 64);

    // Notifications reach the broker through a plain channel, so the bridge
    // never holds a client handle.
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(256);
    notify.attach_mqtt(outbound_tx);

    let response_topic = config.response_topic();
    let publisher = client.clone();
    let forward_topic = response_topic.clone();
    let _ = tokio::spawn(async move {
        while let Some(payload) = outbound_rx.recv().await {
            if let Err(e) = publisher
                .publish(&forward_topic, QoS::AtLeastOnce, false, payload)
                .await
            {
                warn!(error = %e, "failed to publish notification to broker");
            }
        }
    });

    let request_topic = config.request_topic();
    tokio::spawn(async move {
        let mut failures: u32 = 0;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    failures = 0;
                    info!(topic = %request_topic, "connected to broker");
                    if let Err(e) = client.subscribe(&request_topic, QoS::AtLeastOnce).await {
                        error!(error = %e, "broker subscribe failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let dispatcher = Arc::clone(&dispatcher);
                    let client = client.clone();
                    let topic = response_topic.clone();
                    let payload = publish.payload.to_vec();
                    let _ = tokio::spawn(async move {
                        if let Some(response) = process_request(&dispatcher, &payload).await {
                            if let Err(e) = client
                                .publish(&topic, QoS::AtLeastOnce, false, response)
                                .await
                            {
                                warn!(error = %e, "failed to publish response to broker");
                            }
                        }
                    });
                }
                Ok(_) => {}
                Err(e) => {
                    failures = failures.saturating_add(1);
                    let delay = Duration::from_secs(1u64 << failures.min(5));
                    warn!(error = %e, retry_in = ?delay, "broker connection error");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    })
}

/// Decode one request payload and dispatch it. Returns the encoded response,
/// or `None` for notifications (requests without an id).
async fn process_request(dispatcher: &ApiDispatcher, payload: &[u8]) -> Option<String> {
    let request: RpcRequest = match serde_json::from_slice(payload) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "unparseable broker request");
            return encode(&RpcResponse::parse_error());
        }
    };
    let response = dispatcher
        .dispatch_rpc(request, Transport::Mqtt, Some(ConnectionId::mqtt()))
        .await?;
    encode(&response)
}

fn encode(response: &RpcResponse) -> Option<String> {
    match serde_json::to_string(response) {
        Ok(json) => Some(json),
        Err(e) => {
            error!(error = %e, "failed to encode broker response");
            None
        }
    }
}
