//! Server configuration.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Crossbar server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Per-connection outbound queue depth before messages are dropped.
    pub max_send_queue: usize,
    /// Maximum time a single handler invocation may run.
    pub handler_timeout_secs: u64,
    /// WebSocket ping interval.
    pub heartbeat_interval_secs: u64,
    /// Optional components to load, in order.
    pub components: Vec<String>,
    pub mqtt: MqttConfig,
    pub status: StatusConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_send_queue: 256,
            handler_timeout_secs: 60,
            heartbeat_interval_secs: 30,
            components: Vec::new(),
            mqtt: MqttConfig::default(),
            status: StatusConfig::default(),
        }
    }
}

/// Broker transport settings. Disabled by default; when enabled the server
/// subscribes to `<instance>/api/request` and publishes responses and
/// notifications on `<instance>/api/response`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Topic prefix identifying this server instance.
    pub instance_name: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".into(),
            port: 1883,
            username: None,
            password: None,
            instance_name: "crossbar".into(),
        }
    }
}

impl MqttConfig {
    pub fn request_topic(&self) -> String {
        format!("{}/api/request", self.instance_name)
    }

    pub fn response_topic(&self) -> String {
        format!("{}/api/response", self.instance_name)
    }
}

/// Object status polling settings.
///
/// Tier `k` is polled every `base_tick_ms * multiplier(k)` where the
/// multiplier doubles per tier and is capped at 32 (1, 2, 4, 8, 16, 32).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub base_tick_ms: u64,
    /// Number of poll tiers (1-based).
    pub num_tiers: u32,
    /// Tier assigned to objects not listed in `tiers`.
    pub default_tier: u32,
    /// Per-object tier overrides.
    pub tiers: HashMap<String, u32>,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            base_tick_ms: 250,
            num_tiers: 6,
            default_tier: 1,
            tiers: HashMap::new(),
        }
    }
}

impl StatusConfig {
    /// Doubling multiplier, capped at 32.
    pub fn tier_multiplier(tier: u32) -> u64 {
        1u64 << (tier.saturating_sub(1)).min(5)
    }

    /// The tier an object polls on, clamped to the configured range.
    pub fn tier_of(&self, object: &str) -> u32 {
        let tier = self.tiers.get(object).copied().unwrap_or(self.default_tier);
        tier.clamp(1, self.num_tiers.max(1))
    }
}
