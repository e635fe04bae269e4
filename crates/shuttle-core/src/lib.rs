//! # shuttle-core
//!
//! Foundation types shared by every shuttle crate:
//!
//! - **Branded IDs**: [`BusId`] and [`ConnectionId`] as newtypes for type safety
//! - **Location events**: [`LocationEvent`], the immutable value fanned out to viewers
//! - **Errors**: [`EventError`] for events rejected before fanout begins

#![deny(unsafe_code)]

pub mod events;
pub mod ids;

pub use events::{EventError, EventKind, LocationEvent};
pub use ids::{BusId, ConnectionId};
