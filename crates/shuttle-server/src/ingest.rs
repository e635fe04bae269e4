//! `POST /buses/{bus_id}/location`: accept a position report and broadcast it.
//!
//! The body mirrors what bus-side clients already send. Telemetry fields
//! beyond the position (`accuracy`, `heading`, `speed`, `current_stop`,
//! `next_stop`, `eta`, `is_active`) are accepted and ignored.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use shuttle_core::EventError;
use shuttle_core::events::{is_iso8601, now_timestamp};
use thiserror::Error;
use tracing::info;

use crate::server::AppState;

/// Request body.
#[derive(Debug, Deserialize)]
pub struct LocationIn {
    /// Latitude in decimal degrees.
    pub latitude: f64,
    /// Longitude in decimal degrees.
    pub longitude: f64,
    /// Producer timestamp. Anything that is not an ISO-8601 string is
    /// replaced by the current time.
    #[serde(default)]
    pub timestamp: Option<serde_json::Value>,
}

impl LocationIn {
    /// Timestamp to publish.
    pub fn resolved_timestamp(&self) -> String {
        match &self.timestamp {
            Some(serde_json::Value::String(ts)) if is_iso8601(ts) => ts.clone(),
            _ => now_timestamp(),
        }
    }
}

/// Success body.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Always `"ok"`.
    pub detail: &'static str,
    /// Subscribers that received the update.
    pub delivered: usize,
    /// Subscribers evicted during this broadcast.
    pub evicted: usize,
}

/// Why an ingest request was refused.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The body could not be parsed.
    #[error("invalid request body: {0}")]
    InvalidBody(String),
    /// The event failed validation.
    #[error(transparent)]
    InvalidEvent(#[from] EventError),
}

impl IntoResponse for IngestError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (StatusCode::UNPROCESSABLE_ENTITY, Json(body)).into_response()
    }
}

/// POST /buses/{bus_id}/location
pub async fn ingest_location(
    State(state): State<AppState>,
    Path(bus_id): Path<String>,
    body: Result<Json<LocationIn>, JsonRejection>,
) -> Result<(StatusCode, Json<IngestResponse>), IngestError> {
    let Json(body) = body.map_err(|e| IngestError::InvalidBody(e.body_text()))?;
    let timestamp = body.resolved_timestamp();
    let report = state
        .fanout
        .notify(bus_id, body.latitude, body.longitude, timestamp)
        .await?;

    info!(
        bus_id = %report.bus_id,
        recipients = report.outcomes.len(),
        evicted = report.evicted,
        "location ingested"
    );
    Ok((
        StatusCode::CREATED,
        Json(IngestResponse {
            detail: "ok",
            delivered: report.delivered(),
            evicted: report.evicted,
        }),
    ))
}
