//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shuttle_settings::{DEFAULT_MAX_SUBSCRIBERS_PER_BUS, ServerSettings};

use crate::websocket::registry::RegistryLimits;

/// Runtime configuration for the shuttle server.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum viewers per bus.
    pub max_subscribers_per_bus: usize,
    /// Mount the unauthenticated all-buses channel at `/ws`.
    pub global_channel: bool,
    /// Maximum viewers of the global channel.
    pub global_capacity: usize,
    /// Per-subscriber delivery deadline in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub send_queue_size: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Mount `POST /buses/{bus_id}/location`.
    pub ingest_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_subscribers_per_bus: DEFAULT_MAX_SUBSCRIBERS_PER_BUS,
            global_channel: false,
            global_capacity: 50,
            delivery_timeout_ms: 5_000,
            send_queue_size: 32,
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 90,
            max_message_size: 64 * 1024,
            ingest_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            max_subscribers_per_bus: settings.max_subscribers_per_bus,
            global_channel: settings.global_channel,
            global_capacity: settings.global_capacity,
            delivery_timeout_ms: settings.delivery_timeout_ms,
            send_queue_size: settings.send_queue_size,
            heartbeat_interval_secs: settings.heartbeat_interval_secs,
            heartbeat_timeout_secs: settings.heartbeat_timeout_secs,
            max_message_size: settings.max_message_size,
            ingest_enabled: settings.ingest_enabled,
        }
    }

    /// Per-subscriber delivery deadline.
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    /// Channel capacities for the registry.
    pub fn registry_limits(&self) -> RegistryLimits {
        RegistryLimits {
            per_bus: self.max_subscribers_per_bus,
            global_channel: self.global_channel,
            global_capacity: self.global_capacity,
        }
    }

    /// `host:port` bind address.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
