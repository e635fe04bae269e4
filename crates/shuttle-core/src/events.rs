//! Location events pushed to bus viewers.
//!
//! A [`LocationEvent`] is validated on construction and serializes directly
//! to the wire payload:
//!
//! ```json
//! {"type":"location_update","bus_id":"7","latitude":10.0,"longitude":20.0,"timestamp":"2024-01-01T00:00:00"}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::BusId;

/// Errors for events rejected before fanout begins.
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// The bus identifier is empty.
    #[error("bus id must not be empty")]
    EmptyBusId,
    /// Latitude is non-finite or outside `[-90, 90]`.
    #[error("latitude out of range: {0}")]
    InvalidLatitude(f64),
    /// Longitude is non-finite or outside `[-180, 180]`.
    #[error("longitude out of range: {0}")]
    InvalidLongitude(f64),
    /// The timestamp is not an ISO-8601 date-time.
    #[error("invalid ISO-8601 timestamp: {0:?}")]
    InvalidTimestamp(String),
}

/// Event-type discriminator carried in the `type` field.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new position for a bus.
    #[default]
    LocationUpdate,
}

/// An immutable position report for one bus.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocationEvent {
    #[serde(rename = "type")]
    kind: EventKind,
    bus_id: BusId,
    latitude: f64,
    longitude: f64,
    timestamp: String,
}

impl LocationEvent {
    /// Build a `location_update` event.
    ///
    /// The timestamp is echoed to subscribers verbatim; it must parse as
    /// RFC 3339 or as a naive `YYYY-MM-DDTHH:MM:SS[.fff]` date-time.
    pub fn new(
        bus_id: impl Into<BusId>,
        latitude: f64,
        longitude: f64,
        timestamp: impl Into<String>,
    ) -> Result<Self, EventError> {
        let bus_id = bus_id.into();
        if bus_id.is_blank() {
            return Err(EventError::EmptyBusId);
        }
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(EventError::InvalidLatitude(latitude));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(EventError::InvalidLongitude(longitude));
        }
        let timestamp = timestamp.into();
        if !is_iso8601(&timestamp) {
            return Err(EventError::InvalidTimestamp(timestamp));
        }
        Ok(Self {
            kind: EventKind::LocationUpdate,
            bus_id,
            latitude,
            longitude,
            timestamp,
        })
    }

    /// Event-type discriminator.
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Bus this event describes.
    pub fn bus_id(&self) -> &BusId {
        &self.bus_id
    }

    /// Latitude in decimal degrees.
    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    /// Longitude in decimal degrees.
    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Timestamp exactly as supplied by the producer.
    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    /// Serialize to the JSON text frame sent to subscribers.
    pub fn to_wire(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Whether `value` is an ISO-8601 date-time (offset-aware or naive).
pub fn is_iso8601(value: &str) -> bool {
    DateTime::parse_from_rfc3339(value).is_ok() || value.parse::<NaiveDateTime>().is_ok()
}

/// Current UTC time as a naive ISO-8601 string with microseconds.
pub fn now_timestamp() -> String {
    Utc::now()
        .naive_utc()
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}
