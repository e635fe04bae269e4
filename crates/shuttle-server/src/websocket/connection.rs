//! WebSocket client connection state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use shuttle_core::ConnectionId;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// Why a single delivery attempt failed.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The connection is closed or its writer has gone away.
    #[error("connection closed")]
    Closed,
    /// The send queue stayed full past the delivery deadline.
    #[error("delivery timed out")]
    TimedOut,
}

/// A connected viewer.
///
/// Shared between the task driving the socket and the registry. Outbound
/// frames go through a bounded FIFO queue drained by the socket writer.
pub struct ClientConnection {
    /// Unique connection ID.
    pub id: ConnectionId,
    /// Send channel to the client's WebSocket write task.
    tx: mpsc::Sender<Arc<String>>,
    /// When this connection was established.
    pub connected_at: Instant,
    /// Whether the client has shown activity since the last heartbeat check.
    is_alive: AtomicBool,
    /// Count of frames that could not be delivered.
    pub dropped_messages: AtomicU64,
    /// Cancelled when the server wants this connection torn down.
    closed: CancellationToken,
}

impl ClientConnection {
    /// Create a new connection.
    pub fn new(id: ConnectionId, tx: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            tx,
            connected_at: Instant::now(),
            is_alive: AtomicBool::new(true),
            dropped_messages: AtomicU64::new(0),
            closed: CancellationToken::new(),
        }
    }

    /// Enqueue a frame, waiting up to `timeout` for queue space.
    pub async fn deliver(&self, message: Arc<String>, timeout: Duration) -> Result<(), DeliveryError> {
        let result = if self.is_closed() {
            Err(DeliveryError::Closed)
        } else {
            match time::timeout(timeout, self.tx.send(message)).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DeliveryError::Closed),
                Err(_) => Err(DeliveryError::TimedOut),
            }
        };
        if result.is_err() {
            let _ = self.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Total frames dropped for this connection.
    pub fn drop_count(&self) -> u64 {
        self.dropped_messages.load(Ordering::Relaxed)
    }

    /// Signal the socket driver to close this connection.
    pub fn close(&self) {
        self.closed.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    /// Token cancelled by [`close`](Self::close).
    pub fn close_signal(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Mark the connection as alive (pong or client frame received).
    pub fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }

    /// Check and reset the alive flag for heartbeat.
    ///
    /// Returns `true` if the connection was alive since the last check.
    pub fn check_alive(&self) -> bool {
        self.is_alive.swap(false, Ordering::Relaxed)
    }

    /// Connection age.
    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .field("dropped_messages", &self.drop_count())
            .finish_non_exhaustive()
    }
}
