use uuid::Uuid;

/// Unique identifier for a client connection (WebSocket or MQTT pseudo-link).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl Default for ConnectionId {
    fn default() -> Self {
        Self(format!("conn_{}", Uuid::now_v7()))
    }
}

impl ConnectionId {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fixed id for the broker pseudo-connection. The MQTT transport speaks
    /// for every broker-side client, so it is modeled as one stable link.
    pub fn mqtt() -> Self {
        Self("conn_mqtt".to_string())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
