//! Concurrent delivery of location events to bus viewers.
//!
//! A broadcast snapshots the recipients, serializes the event once, issues
//! one delivery future per recipient, and joins them all. Failed recipients
//! are evicted only after every attempt has settled.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use metrics::counter;
use shuttle_core::{BusId, ConnectionId, EventError, LocationEvent};
use tracing::{debug, warn};

use super::connection::DeliveryError;
use super::registry::SubscriptionRegistry;
use crate::metrics::{
    BROADCAST_DELIVERIES_TOTAL, BROADCAST_DELIVERY_FAILURES_TOTAL, BROADCAST_EVICTIONS_TOTAL,
    BROADCAST_TOTAL,
};

/// Result of one delivery attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The frame was queued for the socket writer.
    Delivered,
    /// The attempt failed; the recipient has been evicted.
    Failed(DeliveryError),
}

/// Per-recipient outcomes of one broadcast.
#[derive(Clone, Debug)]
pub struct DeliveryReport {
    /// Bus the event was addressed to.
    pub bus_id: BusId,
    /// One entry per recipient in the snapshot.
    pub outcomes: Vec<(ConnectionId, DeliveryOutcome)>,
    /// Recipients actually removed from the registry.
    pub evicted: usize,
}

impl DeliveryReport {
    fn empty(bus_id: BusId) -> Self {
        Self {
            bus_id,
            outcomes: Vec::new(),
            evicted: 0,
        }
    }

    /// Number of successful deliveries.
    pub fn delivered(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| *o == DeliveryOutcome::Delivered)
            .count()
    }

    /// Number of failed deliveries.
    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.delivered()
    }

    /// Whether there were no recipients at all.
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Outcome for a given connection, if it was a recipient.
    pub fn outcome_for(&self, id: &ConnectionId) -> Option<DeliveryOutcome> {
        self.outcomes
            .iter()
            .find(|(conn_id, _)| conn_id == id)
            .map(|(_, o)| *o)
    }
}

/// Delivers events to the subscribers of a bus.
pub struct FanoutEngine {
    registry: Arc<SubscriptionRegistry>,
    delivery_timeout: Duration,
}

impl FanoutEngine {
    /// Create an engine over `registry`.
    ///
    /// `delivery_timeout` bounds how long one recipient's full queue may
    /// stall its delivery before it counts as failed.
    pub fn new(registry: Arc<SubscriptionRegistry>, delivery_timeout: Duration) -> Self {
        Self {
            registry,
            delivery_timeout,
        }
    }

    /// The registry this engine reads from.
    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Validate and broadcast a location update.
    ///
    /// Fails only if the event is malformed; delivery failures are handled
    /// by eviction and reported in the returned [`DeliveryReport`].
    pub async fn notify(
        &self,
        bus_id: impl Into<BusId>,
        latitude: f64,
        longitude: f64,
        timestamp: impl Into<String>,
    ) -> Result<DeliveryReport, EventError> {
        let event = LocationEvent::new(bus_id, latitude, longitude, timestamp)?;
        Ok(self.broadcast(&event).await)
    }

    /// Deliver `event` to every current viewer of its bus (and of the
    /// global channel), then evict the recipients that failed.
    pub async fn broadcast(&self, event: &LocationEvent) -> DeliveryReport {
        let bus_id = event.bus_id();
        let recipients = self.registry.recipients(bus_id);
        if recipients.is_empty() {
            debug!(bus_id = %bus_id, "no subscribers, skipping broadcast");
            return DeliveryReport::empty(bus_id.clone());
        }

        let payload = match event.to_wire() {
            Ok(json) => Arc::new(json),
            Err(e) => {
                warn!(bus_id = %bus_id, error = %e, "failed to serialize location event");
                return DeliveryReport::empty(bus_id.clone());
            }
        };

        counter!(BROADCAST_TOTAL).increment(1);
        let timeout = self.delivery_timeout;
        let attempts = recipients.into_iter().map(|(key, conn)| {
            let payload = Arc::clone(&payload);
            async move {
                let result = conn.deliver(payload, timeout).await;
                (key, conn, result)
            }
        });
        let settled = join_all(attempts).await;

        let mut report = DeliveryReport::empty(bus_id.clone());
        for (key, conn, result) in settled {
            match result {
                Ok(()) => {
                    counter!(BROADCAST_DELIVERIES_TOTAL).increment(1);
                    report
                        .outcomes
                        .push((conn.id.clone(), DeliveryOutcome::Delivered));
                }
                Err(err) => {
                    counter!(BROADCAST_DELIVERY_FAILURES_TOTAL).increment(1);
                    if self.registry.release(&key, &conn.id) {
                        report.evicted += 1;
                        counter!(BROADCAST_EVICTIONS_TOTAL).increment(1);
                        warn!(conn_id = %conn.id, channel = %key, error = %err, "evicting subscriber");
                    }
                    conn.close();
                    report
                        .outcomes
                        .push((conn.id.clone(), DeliveryOutcome::Failed(err)));
                }
            }
        }

        debug!(
            bus_id = %bus_id,
            recipients = report.outcomes.len(),
            delivered = report.delivered(),
            evicted = report.evicted,
            "broadcast location"
        );
        report
    }
}
