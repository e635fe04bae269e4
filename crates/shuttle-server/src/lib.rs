//! # shuttle-server
//!
//! Axum HTTP + `WebSocket` server that pushes live bus positions to viewers.
//!
//! - `WebSocket` gateway: credential check at handshake, per-bus channels with a
//!   hard viewer cap, heartbeat, exactly-once deregistration on close
//! - Fanout: one location event delivered concurrently to every viewer of its
//!   bus; failed viewers are evicted afterwards
//! - HTTP endpoints: health check, location ingest, Prometheus metrics
//! - Graceful shutdown via `CancellationToken`

#![deny(unsafe_code)]

pub mod config;
pub mod health;
pub mod ingest;
pub mod metrics;
pub mod server;
pub mod shutdown;
pub mod websocket;

pub use config::ServerConfig;
pub use server::{AppState, ShuttleServer};
pub use shutdown::ShutdownCoordinator;
pub use websocket::fanout::{DeliveryOutcome, DeliveryReport, FanoutEngine};
pub use websocket::lifecycle::{CloseReason, ConnectionState, Rejection};
pub use websocket::registry::{Admission, AdmissionError, ChannelKey, RegistryLimits, SubscriptionRegistry};
