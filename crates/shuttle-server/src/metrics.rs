//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    describe();
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

fn describe() {
    metrics::describe_counter!(WS_CONNECTIONS_TOTAL, "Subscribers admitted");
    metrics::describe_counter!(WS_DISCONNECTIONS_TOTAL, "Admitted subscribers that disconnected");
    metrics::describe_counter!(
        WS_ADMISSION_REJECTED_TOTAL,
        "Subscriptions refused, by reason"
    );
    metrics::describe_gauge!(WS_SUBSCRIBERS_ACTIVE, "Current subscriptions across all channels");
    metrics::describe_counter!(BROADCAST_TOTAL, "Broadcasts with at least one recipient");
    metrics::describe_counter!(BROADCAST_DELIVERIES_TOTAL, "Successful deliveries");
    metrics::describe_counter!(BROADCAST_DELIVERY_FAILURES_TOTAL, "Failed deliveries");
    metrics::describe_counter!(BROADCAST_EVICTIONS_TOTAL, "Subscribers evicted after a failed delivery");
}

/// Subscribers admitted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Admitted subscribers that disconnected (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Refused subscriptions (counter, labels: reason).
pub const WS_ADMISSION_REJECTED_TOTAL: &str = "ws_admission_rejected_total";
/// Current subscriptions (gauge).
pub const WS_SUBSCRIBERS_ACTIVE: &str = "ws_subscribers_active";
/// Broadcasts issued (counter).
pub const BROADCAST_TOTAL: &str = "broadcast_total";
/// Successful deliveries (counter).
pub const BROADCAST_DELIVERIES_TOTAL: &str = "broadcast_deliveries_total";
/// Failed deliveries (counter).
pub const BROADCAST_DELIVERY_FAILURES_TOTAL: &str = "broadcast_delivery_failures_total";
/// Evicted subscribers (counter).
pub const BROADCAST_EVICTIONS_TOTAL: &str = "broadcast_evictions_total";
