//! Settings types.
//!
//! Every struct uses `#[serde(default)]` so a partial settings file only
//! needs the keys it overrides.

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Default ceiling on viewers per bus.
pub const DEFAULT_MAX_SUBSCRIBERS_PER_BUS: usize = 5;

/// JWT algorithms accepted for viewer credentials (shared-secret HMAC only).
pub const SUPPORTED_ALGORITHMS: [&str; 3] = ["HS256", "HS384", "HS512"];

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ShuttleSettings {
    /// Network, channel, and connection settings.
    pub server: ServerSettings,
    /// Credential verification settings.
    pub auth: AuthSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl ShuttleSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_subscribers_per_bus == 0 {
            return Err(SettingsError::InvalidValue(
                "server.maxSubscribersPerBus must be at least 1".into(),
            ));
        }
        if self.server.global_channel && self.server.global_capacity == 0 {
            return Err(SettingsError::InvalidValue(
                "server.globalCapacity must be at least 1 when the global channel is enabled"
                    .into(),
            ));
        }
        if self.server.send_queue_size == 0 {
            return Err(SettingsError::InvalidValue(
                "server.sendQueueSize must be at least 1".into(),
            ));
        }
        if self.server.delivery_timeout_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "server.deliveryTimeoutMs must be at least 1".into(),
            ));
        }
        if !SUPPORTED_ALGORITHMS.contains(&self.auth.algorithm.as_str()) {
            return Err(SettingsError::InvalidValue(format!(
                "auth.algorithm {:?} is not one of {SUPPORTED_ALGORITHMS:?}",
                self.auth.algorithm
            )));
        }
        if self.auth.secret_key.is_empty() {
            return Err(SettingsError::InvalidValue(
                "auth.secretKey must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// Server network and broadcast settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Maximum concurrent viewers of one bus.
    pub max_subscribers_per_bus: usize,
    /// Mount the unauthenticated all-buses channel at `/ws`.
    pub global_channel: bool,
    /// Maximum concurrent viewers of the global channel.
    pub global_capacity: usize,
    /// Per-subscriber delivery deadline in milliseconds.
    pub delivery_timeout_ms: u64,
    /// Outbound frames buffered per connection.
    pub send_queue_size: usize,
    /// Ping interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close after this many seconds without a pong.
    pub heartbeat_timeout_secs: u64,
    /// Largest inbound WebSocket message accepted, in bytes.
    pub max_message_size: usize,
    /// Mount `POST /buses/{bus_id}/location`.
    pub ingest_enabled: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
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

/// Viewer credential settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// Shared HMAC secret used to sign viewer tokens.
    pub secret_key: String,
    /// JWT algorithm name (`HS256`, `HS384`, `HS512`).
    pub algorithm: String,
    /// Clock skew tolerated on `exp`, in seconds.
    pub leeway_secs: u64,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            secret_key: "CHANGE_THIS_TO_A_SECURE_RANDOM_KEY".to_string(),
            algorithm: "HS256".to_string(),
            leeway_secs: 0,
        }
    }
}

impl std::fmt::Debug for AuthSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthSettings")
            .field("secret_key", &"<redacted>")
            .field("algorithm", &self.algorithm)
            .field("leeway_secs", &self.leeway_secs)
            .finish()
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
