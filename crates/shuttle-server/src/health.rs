//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Service name reported by the health endpoint.
pub const SERVICE_NAME: &str = "shuttle-broadcast";

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Service name.
    pub service: &'static str,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Current subscriptions across all channels.
    pub connections: usize,
    /// Bus channels with at least one viewer.
    pub channels: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, channels: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        service: SERVICE_NAME,
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
        channels,
    }
}
