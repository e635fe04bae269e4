//! Connection lifecycle: `Handshaking → Active → Closed`.
//!
//! A connection is admitted (credential check, then registry admission)
//! while handshaking. Admission yields a [`SubscriptionGuard`]; entering
//! `Closed` from `Active` releases it, which unsubscribes exactly once no
//! matter how many termination signals race.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use metrics::counter;
use shuttle_auth::CredentialVerifier;
use shuttle_core::{BusId, ConnectionId};
use tracing::debug;

use super::connection::ClientConnection;
use super::registry::{AdmissionError, ChannelKey, SubscriptionRegistry};
use crate::metrics::WS_ADMISSION_REJECTED_TOTAL;

/// Server is going away (shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Credential missing, invalid, or not permitted.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
/// Channel at capacity; the client may retry later.
pub const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Where a connection is in its life.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Upgraded, not yet admitted.
    Handshaking,
    /// Subscribed and receiving events.
    Active,
    /// Terminal.
    Closed,
}

/// A refused handshake and the close frame that reports it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rejection {
    /// WebSocket close code.
    pub code: u16,
    /// Close frame reason text.
    pub reason: &'static str,
}

impl Rejection {
    const fn policy(reason: &'static str) -> Self {
        Self {
            code: CLOSE_POLICY_VIOLATION,
            reason,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self.code {
            CLOSE_TRY_AGAIN_LATER => "full",
            _ => "policy",
        }
    }
}

impl From<&AdmissionError> for Rejection {
    fn from(err: &AdmissionError) -> Self {
        match err {
            AdmissionError::Unauthorized(_) => Self::policy("role not permitted"),
            AdmissionError::Full { .. } => Self {
                code: CLOSE_TRY_AGAIN_LATER,
                reason: "channel full",
            },
            AdmissionError::GlobalChannelDisabled => Self::policy("global channel disabled"),
        }
    }
}

/// Why a connection entered `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// Refused during the handshake.
    Rejected(Rejection),
    /// The client sent a close frame or hung up.
    ClientClosed,
    /// Reading from the socket failed.
    ReadError,
    /// Writing to the socket failed.
    WriteError,
    /// No pong or client frame within the heartbeat timeout.
    HeartbeatTimeout,
    /// Evicted after a failed delivery.
    Evicted,
    /// The server is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Close frame to send, if the socket is still usable.
    pub fn close_frame(&self) -> Option<(u16, &'static str)> {
        match self {
            Self::Rejected(r) => Some((r.code, r.reason)),
            Self::Shutdown => Some((CLOSE_GOING_AWAY, "server shutting down")),
            Self::HeartbeatTimeout => Some((CLOSE_GOING_AWAY, "heartbeat timeout")),
            Self::Evicted => Some((CLOSE_GOING_AWAY, "delivery failed")),
            Self::ClientClosed | Self::ReadError | Self::WriteError => None,
        }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Rejected(_) => "rejected",
            Self::ClientClosed => "client_closed",
            Self::ReadError => "read_error",
            Self::WriteError => "write_error",
            Self::HeartbeatTimeout => "heartbeat_timeout",
            Self::Evicted => "evicted",
            Self::Shutdown => "shutdown",
        }
    }
}

/// Holds one registry subscription and releases it at most once.
///
/// Dropping the guard releases it too.
pub struct SubscriptionGuard {
    registry: Arc<SubscriptionRegistry>,
    key: ChannelKey,
    connection_id: ConnectionId,
    released: AtomicBool,
}

impl SubscriptionGuard {
    fn new(registry: Arc<SubscriptionRegistry>, key: ChannelKey, connection_id: ConnectionId) -> Self {
        Self {
            registry,
            key,
            connection_id,
            released: AtomicBool::new(false),
        }
    }

    /// Channel this guard holds a place in.
    pub fn key(&self) -> &ChannelKey {
        &self.key
    }

    /// Unsubscribe. Returns `true` only for the call that performed the release.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.registry.release(&self.key, &self.connection_id);
        true
    }

    /// Whether [`release`](Self::release) has run.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for SubscriptionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGuard")
            .field("key", &self.key)
            .field("connection_id", &self.connection_id)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

/// State machine for one connection.
pub struct Lifecycle {
    connection_id: ConnectionId,
    state: ConnectionState,
    guard: Option<SubscriptionGuard>,
    close_reason: Option<CloseReason>,
}

impl Lifecycle {
    /// Start in `Handshaking`.
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            state: ConnectionState::Handshaking,
            guard: None,
            close_reason: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Why the connection closed, once it has.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// `Handshaking → Active`. Any other starting state releases `guard` and
    /// returns `false`.
    pub fn activate(&mut self, guard: SubscriptionGuard) -> bool {
        if self.state != ConnectionState::Handshaking {
            let _ = guard.release();
            return false;
        }
        self.guard = Some(guard);
        self.state = ConnectionState::Active;
        true
    }

    /// Enter `Closed`, releasing the subscription if one is held.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&mut self, reason: CloseReason) -> bool {
        if self.state == ConnectionState::Closed {
            return false;
        }
        if let Some(guard) = self.guard.take() {
            let _ = guard.release();
        }
        debug!(conn_id = %self.connection_id, from = ?self.state, reason = reason.label(), "connection closed");
        self.state = ConnectionState::Closed;
        self.close_reason = Some(reason);
        true
    }
}

/// Admit a connection to the channel for `bus_id`.
///
/// The credential is checked before the registry is consulted; a missing or
/// rejected credential never reaches admission.
pub fn admit_bus(
    registry: &Arc<SubscriptionRegistry>,
    verifier: &dyn CredentialVerifier,
    bus_id: &BusId,
    credential: Option<&str>,
    connection: &Arc<ClientConnection>,
) -> Result<SubscriptionGuard, Rejection> {
    if bus_id.is_blank() {
        return Err(credential_rejection("invalid bus id"));
    }
    let credential = credential
        .filter(|c| !c.is_empty())
        .ok_or_else(|| credential_rejection("missing token"))?;
    let claim = verifier.verify(credential).map_err(|e| {
        debug!(conn_id = %connection.id, bus_id = %bus_id, error = %e, "credential rejected");
        credential_rejection("invalid token")
    })?;
    let _ = registry
        .subscribe(bus_id, Arc::clone(connection), &claim)
        .map_err(|e| Rejection::from(&e))?;
    Ok(SubscriptionGuard::new(
        Arc::clone(registry),
        ChannelKey::Bus(bus_id.clone()),
        connection.id.clone(),
    ))
}

/// Rejection raised before the registry is consulted.
fn credential_rejection(reason: &'static str) -> Rejection {
    counter!(WS_ADMISSION_REJECTED_TOTAL, "reason" => "credential").increment(1);
    Rejection::policy(reason)
}

/// Admit a connection to the global channel. No credential is required.
pub fn admit_global(
    registry: &Arc<SubscriptionRegistry>,
    connection: &Arc<ClientConnection>,
) -> Result<SubscriptionGuard, Rejection> {
    let _ = registry
        .subscribe_global(Arc::clone(connection))
        .map_err(|e| Rejection::from(&e))?;
    Ok(SubscriptionGuard::new(
        Arc::clone(registry),
        ChannelKey::Global,
        connection.id.clone(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::registry::RegistryLimits;
    use assert_matches::assert_matches;
    use shuttle_auth::{AuthClaim, AuthError, Role};
    use tokio::sync::mpsc;

    /// Treats the credential text as the role name; `"bad"` fails verification.
    struct RoleNameVerifier;

    impl CredentialVerifier for RoleNameVerifier {
        fn verify(&self, credential: &str) -> shuttle_auth::Result<AuthClaim> {
            if credential == "bad" {
                return Err(AuthError::MissingRole);
            }
            Ok(AuthClaim::with_role(Role::parse(credential)))
        }
    }

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ClientConnection::new(ConnectionId::new(), tx)), rx)
    }

    fn registry(limits: RegistryLimits) -> Arc<SubscriptionRegistry> {
        Arc::new(SubscriptionRegistry::new(limits))
    }

    fn bus(id: &str) -> BusId {
        BusId::from(id)
    }

    #[test]
    fn admitted_connection_is_registered() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        assert_eq!(guard.key(), &ChannelKey::Bus(bus("7")));
        assert!(reg.is_subscribed(&bus("7"), &conn.id));
    }

    #[test]
    fn missing_token_is_policy_violation() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        for credential in [None, Some("")] {
            let rejection = admit_bus(&reg, &RoleNameVerifier, &bus("7"), credential, &conn)
                .err()
                .unwrap();
            assert_eq!(rejection.code, CLOSE_POLICY_VIOLATION);
            assert_eq!(rejection.reason, "missing token");
        }
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn invalid_token_is_policy_violation() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let rejection = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("bad"), &conn)
            .err()
            .unwrap();
        assert_eq!(rejection, Rejection::policy("invalid token"));
        assert_eq!(reg.channel_count(), 0);
    }

    #[test]
    fn driver_is_policy_violation() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let rejection = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("driver"), &conn)
            .err()
            .unwrap();
        assert_eq!(rejection.code, CLOSE_POLICY_VIOLATION);
        assert!(reg.subscribers_of(&bus("7")).is_empty());
    }

    #[test]
    fn blank_bus_is_policy_violation() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let rejection = admit_bus(&reg, &RoleNameVerifier, &bus(" "), Some("admin"), &conn)
            .err()
            .unwrap();
        assert_eq!(rejection.reason, "invalid bus id");
    }

    #[test]
    fn full_channel_is_try_again_later() {
        let reg = registry(RegistryLimits {
            per_bus: 1,
            ..RegistryLimits::default()
        });
        let (first, _rx1) = make_connection();
        let (second, _rx2) = make_connection();
        let _guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("admin"), &first).unwrap();
        let rejection = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("admin"), &second)
            .err()
            .unwrap();
        assert_eq!(rejection.code, CLOSE_TRY_AGAIN_LATER);
        assert_eq!(rejection.label(), "full");
    }

    #[test]
    fn guard_releases_exactly_once() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        assert!(guard.release());
        assert!(guard.is_released());
        assert!(!guard.release());
        assert_eq!(reg.subscriber_count(&bus("7")), 0);
    }

    #[test]
    fn dropping_guard_unsubscribes() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        {
            let _guard =
                admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
            assert_eq!(reg.subscriber_count(&bus("7")), 1);
        }
        assert_eq!(reg.channel_count(), 0);
    }

    #[test]
    fn stale_guard_does_not_remove_readmitted_connection() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        assert!(guard.release());
        let _again = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        drop(guard);
        assert!(reg.is_subscribed(&bus("7"), &conn.id));
    }

    #[test]
    fn lifecycle_happy_path() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let mut lifecycle = Lifecycle::new(conn.id.clone());
        assert_eq!(lifecycle.state(), ConnectionState::Handshaking);

        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        assert!(lifecycle.activate(guard));
        assert_eq!(lifecycle.state(), ConnectionState::Active);
        assert_eq!(reg.subscriber_count(&bus("7")), 1);

        assert!(lifecycle.close(CloseReason::ClientClosed));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
        assert_eq!(lifecycle.close_reason(), Some(CloseReason::ClientClosed));
        assert_eq!(reg.subscriber_count(&bus("7")), 0);
    }

    #[test]
    fn second_close_is_a_no_op() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let mut lifecycle = Lifecycle::new(conn.id.clone());
        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        let _ = lifecycle.activate(guard);

        assert!(lifecycle.close(CloseReason::HeartbeatTimeout));
        assert!(!lifecycle.close(CloseReason::Shutdown));
        assert_eq!(lifecycle.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[test]
    fn rejected_handshake_closes_without_admission() {
        let mut lifecycle = Lifecycle::new(ConnectionId::new());
        let rejection = Rejection::policy("missing token");
        assert!(lifecycle.close(CloseReason::Rejected(rejection)));
        assert_eq!(
            lifecycle.close_reason().and_then(|r| r.close_frame()),
            Some((CLOSE_POLICY_VIOLATION, "missing token"))
        );
    }

    #[test]
    fn activate_after_close_releases_guard() {
        let reg = registry(RegistryLimits::default());
        let (conn, _rx) = make_connection();
        let mut lifecycle = Lifecycle::new(conn.id.clone());
        let _ = lifecycle.close(CloseReason::Shutdown);
        let guard = admit_bus(&reg, &RoleNameVerifier, &bus("7"), Some("student"), &conn).unwrap();
        assert!(!lifecycle.activate(guard));
        assert_eq!(reg.subscriber_count(&bus("7")), 0);
    }

    #[test]
    fn global_admission() {
        let (conn, _rx) = make_connection();
        let disabled = registry(RegistryLimits::default());
        assert_matches!(
            admit_global(&disabled, &conn),
            Err(Rejection { code: CLOSE_POLICY_VIOLATION, .. })
        );

        let enabled = registry(RegistryLimits {
            global_channel: true,
            ..RegistryLimits::default()
        });
        let guard = admit_global(&enabled, &conn).unwrap();
        assert_eq!(guard.key(), &ChannelKey::Global);
        assert_eq!(enabled.global_count(), 1);
        drop(guard);
        assert_eq!(enabled.global_count(), 0);
    }

    #[test]
    fn close_frames() {
        assert_eq!(
            CloseReason::Shutdown.close_frame(),
            Some((CLOSE_GOING_AWAY, "server shutting down"))
        );
        assert_eq!(CloseReason::ClientClosed.close_frame(), None);
        assert_eq!(CloseReason::ReadError.close_frame(), None);
        assert_eq!(CloseReason::Evicted.label(), "evicted");
    }
}
