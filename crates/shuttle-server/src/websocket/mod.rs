//! Bus subscriptions over WebSocket: registry, fanout, lifecycle, heartbeat.

pub mod connection;
pub mod fanout;
pub mod handler;
pub mod heartbeat;
pub mod lifecycle;
pub mod registry;
