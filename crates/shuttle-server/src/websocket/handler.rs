//! WebSocket upgrade handlers and the per-connection socket driver.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::response::Response;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use shuttle_core::{BusId, ConnectionId};
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::connection::ClientConnection;
use super::heartbeat::{HeartbeatResult, run_heartbeat};
use super::lifecycle::{
    CloseReason, Lifecycle, Rejection, SubscriptionGuard, admit_bus, admit_global,
};
use super::registry::ChannelKey;
use crate::metrics::{WS_CONNECTIONS_TOTAL, WS_DISCONNECTIONS_TOTAL};
use crate::server::AppState;

/// Query string of the subscribe endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct SubscribeParams {
    /// Bearer credential.
    pub token: Option<String>,
}

/// Extract a bearer token from the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_string())
}

/// Credential from the `token` query parameter, falling back to the header.
fn credential(params: SubscribeParams, headers: &HeaderMap) -> Option<String> {
    params
        .token
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(headers))
}

/// GET /ws/subscribe/{bus_id}
pub async fn subscribe_bus(
    ws: WebSocketUpgrade,
    Path(bus_id): Path<String>,
    Query(params): Query<SubscribeParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let credential = credential(params, &headers);
    let bus_id = BusId::from(bus_id);
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, rx) = open_connection(&state);
            let admitted = admit_bus(
                &state.registry,
                state.verifier.as_ref(),
                &bus_id,
                credential.as_deref(),
                &conn,
            );
            serve(socket, state, conn, rx, admitted).await;
        })
}

/// GET /ws (global channel, unauthenticated)
pub async fn subscribe_global(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| async move {
            let (conn, rx) = open_connection(&state);
            let admitted = admit_global(&state.registry, &conn);
            serve(socket, state, conn, rx, admitted).await;
        })
}

fn open_connection(state: &AppState) -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
    let (tx, rx) = mpsc::channel(state.config.send_queue_size.max(1));
    (Arc::new(ClientConnection::new(ConnectionId::new(), tx)), rx)
}

/// Run one connection from handshake outcome to close.
async fn serve(
    mut socket: WebSocket,
    state: AppState,
    conn: Arc<ClientConnection>,
    rx: mpsc::Receiver<Arc<String>>,
    admitted: Result<SubscriptionGuard, Rejection>,
) {
    let mut lifecycle = Lifecycle::new(conn.id.clone());
    let guard = match admitted {
        Ok(guard) => guard,
        Err(rejection) => {
            debug!(
                conn_id = %conn.id,
                kind = rejection.label(),
                code = rejection.code,
                reason = rejection.reason,
                "handshake rejected"
            );
            let _ = lifecycle.close(CloseReason::Rejected(rejection));
            let _ = socket.send(close_message(rejection.code, rejection.reason)).await;
            return;
        }
    };

    let channel: ChannelKey = guard.key().clone();
    let _ = lifecycle.activate(guard);
    counter!(WS_CONNECTIONS_TOTAL).increment(1);
    info!(conn_id = %conn.id, channel = %channel, "subscriber connected");

    let timings = DriveTimings {
        heartbeat_interval: Duration::from_secs(state.config.heartbeat_interval_secs.max(1)),
        heartbeat_timeout: Duration::from_secs(state.config.heartbeat_timeout_secs),
    };
    let reason = drive(socket, Arc::clone(&conn), rx, timings, state.shutdown.token()).await;

    let _ = lifecycle.close(reason);
    counter!(WS_DISCONNECTIONS_TOTAL).increment(1);
    info!(
        conn_id = %conn.id,
        channel = %channel,
        reason = reason.label(),
        age_secs = conn.age().as_secs(),
        "subscriber disconnected"
    );
}

/// Ping cadence and liveness deadline for an active connection.
#[derive(Clone, Copy, Debug)]
pub struct DriveTimings {
    /// Ping and liveness check interval.
    pub heartbeat_interval: Duration,
    /// Silence tolerated before the connection is dropped.
    pub heartbeat_timeout: Duration,
}

/// How long the writer gets to flush the close frame before it is abandoned.
const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Why the writer task stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WriterExit {
    /// Every queue sender is gone.
    QueueClosed,
    /// A socket write failed.
    WriteFailed,
    /// The driver asked for a close.
    Closed,
}

/// Pump an active connection until something ends it.
///
/// Queued frames are written in FIFO order by a dedicated writer task, so a
/// client that stops reading never holds up teardown. Client input only
/// refreshes liveness. Returns the reason the
/// connection ended, after handing the matching close frame to the writer.
pub async fn drive(
    socket: WebSocket,
    conn: Arc<ClientConnection>,
    rx: mpsc::Receiver<Arc<String>>,
    timings: DriveTimings,
    shutdown: CancellationToken,
) -> CloseReason {
    let (ws_tx, mut ws_rx) = socket.split();
    let (close_tx, close_rx) = oneshot::channel();
    let mut writer = tokio::spawn(run_writer(ws_tx, rx, timings.heartbeat_interval, close_rx));

    let evicted = conn.close_signal();
    let heartbeat_cancel = CancellationToken::new();
    let heartbeat = run_heartbeat(
        Arc::clone(&conn),
        timings.heartbeat_interval,
        timings.heartbeat_timeout,
        heartbeat_cancel.clone(),
    );
    tokio::pin!(heartbeat);

    let (reason, writer_done) = loop {
        tokio::select! {
            exit = &mut writer => {
                let reason = match exit {
                    Ok(WriterExit::QueueClosed) => CloseReason::Evicted,
                    Ok(WriterExit::WriteFailed | WriterExit::Closed) | Err(_) => CloseReason::WriteError,
                };
                break (reason, true);
            }
            inbound = ws_rx.next() => match inbound {
                Some(Ok(Message::Close(_))) | None => break (CloseReason::ClientClosed, false),
                Some(Ok(_)) => conn.mark_alive(),
                Some(Err(e)) => {
                    debug!(conn_id = %conn.id, error = %e, "websocket read failed");
                    break (CloseReason::ReadError, false);
                }
            },
            result = &mut heartbeat => {
                debug_assert_eq!(result, HeartbeatResult::TimedOut);
                break (CloseReason::HeartbeatTimeout, false);
            }
            () = evicted.cancelled() => break (CloseReason::Evicted, false),
            () = shutdown.cancelled() => break (CloseReason::Shutdown, false),
        }
    };
    heartbeat_cancel.cancel();

    if !writer_done {
        let _ = close_tx.send(reason.close_frame());
        if time::timeout(CLOSE_FLUSH_TIMEOUT, &mut writer).await.is_err() {
            debug!(conn_id = %conn.id, "writer stalled, abandoning socket");
            writer.abort();
        }
    }
    reason
}

/// Drain the send queue into the socket and ping on `ping_interval`.
///
/// A close request takes priority over queued frames.
async fn run_writer(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Arc<String>>,
    ping_interval: Duration,
    mut close_rx: oneshot::Receiver<Option<(u16, &'static str)>>,
) -> WriterExit {
    let mut ping = time::interval(ping_interval);
    let _ = ping.tick().await;

    loop {
        tokio::select! {
            biased;
            frame = &mut close_rx => {
                if let Ok(Some((code, text))) = frame {
                    let _ = ws_tx.send(close_message(code, text)).await;
                }
                let _ = ws_tx.close().await;
                return WriterExit::Closed;
            }
            outbound = rx.recv() => {
                let Some(text) = outbound else {
                    return WriterExit::QueueClosed;
                };
                if ws_tx.send(Message::Text(text.as_str().into())).await.is_err() {
                    return WriterExit::WriteFailed;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return WriterExit::WriteFailed;
                }
            }
        }
    }
}

fn close_message(code: u16, reason: &'static str) -> Message {
    Message::Close(Some(CloseFrame {
        code,
        reason: reason.into(),
    }))
}
