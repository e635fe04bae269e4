//! Subscription registry: which connections watch which bus.
//!
//! All channel state lives behind one registry-wide lock, so admission
//! (capacity check plus insert) is atomic with respect to every other
//! subscribe, unsubscribe, and snapshot. The lock is never held across an
//! `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use shuttle_auth::AuthClaim;
use shuttle_core::{BusId, ConnectionId};
use thiserror::Error;
use tracing::debug;

use super::connection::ClientConnection;
use crate::metrics::{WS_ADMISSION_REJECTED_TOTAL, WS_SUBSCRIBERS_ACTIVE};

/// Names one channel in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKey {
    /// Viewers of a single bus.
    Bus(BusId),
    /// Viewers of every bus.
    Global,
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bus(id) => write!(f, "bus:{id}"),
            Self::Global => f.write_str("global"),
        }
    }
}

/// Why a subscription was refused.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AdmissionError {
    /// The claim's role may not view buses.
    #[error("role {0:?} may not subscribe")]
    Unauthorized(String),
    /// The channel already holds its maximum number of viewers.
    #[error("channel is full ({capacity} subscribers)")]
    Full {
        /// Capacity of the refused channel.
        capacity: usize,
    },
    /// The global channel is switched off.
    #[error("global channel is disabled")]
    GlobalChannelDisabled,
}

impl AdmissionError {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Unauthorized(_) => "unauthorized",
            Self::Full { .. } => "full",
            Self::GlobalChannelDisabled => "global_disabled",
        }
    }
}

/// Successful admission.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The connection was added to the channel.
    Added,
    /// The connection was already a member; nothing changed.
    AlreadySubscribed,
}

/// Channel capacities and switches.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegistryLimits {
    /// Maximum viewers of one bus.
    pub per_bus: usize,
    /// Whether the global channel accepts viewers.
    pub global_channel: bool,
    /// Maximum viewers of the global channel.
    pub global_capacity: usize,
}

impl Default for RegistryLimits {
    fn default() -> Self {
        Self {
            per_bus: shuttle_settings::DEFAULT_MAX_SUBSCRIBERS_PER_BUS,
            global_channel: false,
            global_capacity: 50,
        }
    }
}

type Members = HashMap<ConnectionId, Arc<ClientConnection>>;

#[derive(Default)]
struct Channels {
    buses: HashMap<BusId, Members>,
    global: Members,
}

impl Channels {
    fn total(&self) -> usize {
        self.buses.values().map(HashMap::len).sum::<usize>() + self.global.len()
    }
}

/// Maps bus IDs to their subscribed connections.
pub struct SubscriptionRegistry {
    channels: Mutex<Channels>,
    limits: RegistryLimits,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    pub fn new(limits: RegistryLimits) -> Self {
        Self {
            channels: Mutex::new(Channels::default()),
            limits,
        }
    }

    /// Per-bus capacity.
    pub fn capacity(&self) -> usize {
        self.limits.per_bus
    }

    /// Whether the global channel is switched on.
    pub fn global_enabled(&self) -> bool {
        self.limits.global_channel
    }

    /// Admit `connection` to the channel for `bus_id`.
    ///
    /// The role check happens before the lock is taken. Subscribing an
    /// already-present connection succeeds without changing anything, even
    /// when the channel is full.
    pub fn subscribe(
        &self,
        bus_id: &BusId,
        connection: Arc<ClientConnection>,
        claim: &AuthClaim,
    ) -> Result<Admission, AdmissionError> {
        if !claim.role.can_view() {
            return Err(self.reject(
                AdmissionError::Unauthorized(claim.role.to_string()),
                &ChannelKey::Bus(bus_id.clone()),
            ));
        }
        let capacity = self.limits.per_bus;
        let mut channels = self.channels.lock();
        let occupied = match channels.buses.get(bus_id) {
            Some(members) if members.contains_key(&connection.id) => {
                return Ok(Admission::AlreadySubscribed);
            }
            Some(members) => members.len(),
            None => 0,
        };
        if occupied >= capacity {
            drop(channels);
            return Err(self.reject(
                AdmissionError::Full { capacity },
                &ChannelKey::Bus(bus_id.clone()),
            ));
        }
        let _ = channels
            .buses
            .entry(bus_id.clone())
            .or_default()
            .insert(connection.id.clone(), connection);
        gauge!(WS_SUBSCRIBERS_ACTIVE).increment(1.0);
        Ok(Admission::Added)
    }

    /// Remove `connection_id` from the channel for `bus_id`.
    ///
    /// Deletes the channel once it empties. Returns whether anything was removed.
    pub fn unsubscribe(&self, bus_id: &BusId, connection_id: &ConnectionId) -> bool {
        let mut channels = self.channels.lock();
        let Some(members) = channels.buses.get_mut(bus_id) else {
            return false;
        };
        let removed = members.remove(connection_id).is_some();
        if members.is_empty() {
            let _ = channels.buses.remove(bus_id);
        }
        if removed {
            gauge!(WS_SUBSCRIBERS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Admit `connection` to the global channel. No identity check applies.
    pub fn subscribe_global(
        &self,
        connection: Arc<ClientConnection>,
    ) -> Result<Admission, AdmissionError> {
        if !self.limits.global_channel {
            return Err(self.reject(AdmissionError::GlobalChannelDisabled, &ChannelKey::Global));
        }
        let capacity = self.limits.global_capacity;
        let mut channels = self.channels.lock();
        if channels.global.contains_key(&connection.id) {
            return Ok(Admission::AlreadySubscribed);
        }
        if channels.global.len() >= capacity {
            drop(channels);
            return Err(self.reject(AdmissionError::Full { capacity }, &ChannelKey::Global));
        }
        let _ = channels.global.insert(connection.id.clone(), connection);
        gauge!(WS_SUBSCRIBERS_ACTIVE).increment(1.0);
        Ok(Admission::Added)
    }

    /// Remove `connection_id` from the global channel.
    pub fn unsubscribe_global(&self, connection_id: &ConnectionId) -> bool {
        let removed = self.channels.lock().global.remove(connection_id).is_some();
        if removed {
            gauge!(WS_SUBSCRIBERS_ACTIVE).decrement(1.0);
        }
        removed
    }

    /// Remove `connection_id` from whichever channel `key` names.
    pub fn release(&self, key: &ChannelKey, connection_id: &ConnectionId) -> bool {
        match key {
            ChannelKey::Bus(bus_id) => self.unsubscribe(bus_id, connection_id),
            ChannelKey::Global => self.unsubscribe_global(connection_id),
        }
    }

    /// Snapshot of the viewers of `bus_id`.
    pub fn subscribers_of(&self, bus_id: &BusId) -> Vec<Arc<ClientConnection>> {
        self.channels
            .lock()
            .buses
            .get(bus_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Everyone who should receive an event for `bus_id`, tagged with the
    /// channel they were found in. Taken under a single lock acquisition.
    pub fn recipients(&self, bus_id: &BusId) -> Vec<(ChannelKey, Arc<ClientConnection>)> {
        let channels = self.channels.lock();
        let bus = channels.buses.get(bus_id).into_iter().flat_map(|members| {
            members
                .values()
                .map(|conn| (ChannelKey::Bus(bus_id.clone()), Arc::clone(conn)))
        });
        let global = channels
            .global
            .values()
            .map(|conn| (ChannelKey::Global, Arc::clone(conn)));
        bus.chain(global).collect()
    }

    /// Whether `connection_id` currently views `bus_id`.
    pub fn is_subscribed(&self, bus_id: &BusId, connection_id: &ConnectionId) -> bool {
        self.channels
            .lock()
            .buses
            .get(bus_id)
            .is_some_and(|members| members.contains_key(connection_id))
    }

    /// Number of viewers of `bus_id`.
    pub fn subscriber_count(&self, bus_id: &BusId) -> usize {
        self.channels.lock().buses.get(bus_id).map_or(0, HashMap::len)
    }

    /// Number of viewers of the global channel.
    pub fn global_count(&self) -> usize {
        self.channels.lock().global.len()
    }

    /// Number of bus channels with at least one viewer.
    pub fn channel_count(&self) -> usize {
        self.channels.lock().buses.len()
    }

    /// Total subscriptions across all channels.
    pub fn connection_count(&self) -> usize {
        self.channels.lock().total()
    }

    /// Bus IDs with at least one viewer.
    pub fn active_buses(&self) -> Vec<BusId> {
        self.channels.lock().buses.keys().cloned().collect()
    }

    fn reject(&self, err: AdmissionError, key: &ChannelKey) -> AdmissionError {
        debug!(channel = %key, reason = err.label(), "subscription rejected");
        counter!(WS_ADMISSION_REJECTED_TOTAL, "reason" => err.label()).increment(1);
        err
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(RegistryLimits::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use shuttle_auth::Role;
    use tokio::sync::mpsc;

    fn make_connection() -> (Arc<ClientConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        (Arc::new(ClientConnection::new(ConnectionId::new(), tx)), rx)
    }

    fn student() -> AuthClaim {
        AuthClaim::with_role(Role::Student)
    }

    fn bus(id: &str) -> BusId {
        BusId::from(id)
    }

    fn registry(per_bus: usize) -> SubscriptionRegistry {
        SubscriptionRegistry::new(RegistryLimits {
            per_bus,
            ..RegistryLimits::default()
        })
    }

    #[test]
    fn default_capacity_is_five() {
        assert_eq!(SubscriptionRegistry::default().capacity(), 5);
        assert!(!SubscriptionRegistry::default().global_enabled());
    }

    #[test]
    fn subscribe_adds_and_creates_channel() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        assert_eq!(reg.channel_count(), 0);
        let admitted = reg.subscribe(&bus("7"), Arc::clone(&conn), &student());
        assert_matches!(admitted, Ok(Admission::Added));
        assert_eq!(reg.subscriber_count(&bus("7")), 1);
        assert_eq!(reg.channel_count(), 1);
        assert!(reg.is_subscribed(&bus("7"), &conn.id));
    }

    #[test]
    fn admin_may_subscribe() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let claim = AuthClaim::with_role(Role::Admin);
        assert!(reg.subscribe(&bus("1"), conn, &claim).is_ok());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&conn), &student()).unwrap();
        let again = reg.subscribe(&bus("7"), Arc::clone(&conn), &student());
        assert_matches!(again, Ok(Admission::AlreadySubscribed));
        assert_eq!(reg.subscriber_count(&bus("7")), 1);
    }

    #[test]
    fn resubscribe_to_full_channel_is_still_idempotent() {
        let reg = registry(1);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&conn), &student()).unwrap();
        assert_matches!(
            reg.subscribe(&bus("7"), conn, &student()),
            Ok(Admission::AlreadySubscribed)
        );
    }

    #[test]
    fn driver_role_rejected() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let claim = AuthClaim::with_role(Role::Driver);
        assert_matches!(
            reg.subscribe(&bus("7"), Arc::clone(&conn), &claim),
            Err(AdmissionError::Unauthorized(role)) if role == "driver"
        );
        assert!(reg.subscribers_of(&bus("7")).is_empty());
        assert_eq!(reg.channel_count(), 0);
    }

    #[test]
    fn unknown_role_rejected() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let claim = AuthClaim::with_role(Role::Other("guest".into()));
        assert!(reg.subscribe(&bus("7"), conn, &claim).is_err());
    }

    #[test]
    fn sixth_subscriber_rejected_as_full() {
        let reg = registry(5);
        let mut keep = Vec::new();
        for _ in 0..5 {
            let (conn, rx) = make_connection();
            assert!(reg.subscribe(&bus("7"), conn, &student()).is_ok());
            keep.push(rx);
        }
        let (extra, _rx) = make_connection();
        assert_matches!(
            reg.subscribe(&bus("7"), Arc::clone(&extra), &student()),
            Err(AdmissionError::Full { capacity: 5 })
        );
        assert!(!reg.is_subscribed(&bus("7"), &extra.id));
        assert_eq!(reg.subscriber_count(&bus("7")), 5);
    }

    #[test]
    fn zero_capacity_never_creates_channel() {
        let reg = registry(0);
        let (conn, _rx) = make_connection();
        assert!(reg.subscribe(&bus("7"), conn, &student()).is_err());
        assert_eq!(reg.channel_count(), 0);
    }

    #[test]
    fn unsubscribe_removes_and_deletes_empty_channel() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&conn), &student()).unwrap();
        assert!(reg.unsubscribe(&bus("7"), &conn.id));
        assert_eq!(reg.subscriber_count(&bus("7")), 0);
        assert_eq!(reg.channel_count(), 0);
        assert!(reg.active_buses().is_empty());
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&conn), &student()).unwrap();
        assert!(reg.unsubscribe(&bus("7"), &conn.id));
        assert!(!reg.unsubscribe(&bus("7"), &conn.id));
        assert!(!reg.unsubscribe(&bus("never"), &conn.id));
        assert_eq!(reg.connection_count(), 0);
    }

    #[test]
    fn unsubscribe_of_stranger_keeps_channel() {
        let reg = registry(5);
        let (member, _rx1) = make_connection();
        let (stranger, _rx2) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&member), &student()).unwrap();
        assert!(!reg.unsubscribe(&bus("7"), &stranger.id));
        assert_eq!(reg.subscriber_count(&bus("7")), 1);
    }

    #[test]
    fn buses_are_isolated() {
        let reg = registry(5);
        let (a, _rx1) = make_connection();
        let (b, _rx2) = make_connection();
        let _ = reg.subscribe(&bus("1"), Arc::clone(&a), &student()).unwrap();
        let _ = reg.subscribe(&bus("2"), Arc::clone(&b), &student()).unwrap();

        let ones: Vec<_> = reg.subscribers_of(&bus("1")).iter().map(|c| c.id.clone()).collect();
        assert_eq!(ones, vec![a.id.clone()]);
        assert!(reg.unsubscribe(&bus("1"), &a.id));
        assert_eq!(reg.subscriber_count(&bus("2")), 1);
    }

    #[test]
    fn subscribers_of_is_a_snapshot() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("7"), Arc::clone(&conn), &student()).unwrap();
        let snapshot = reg.subscribers_of(&bus("7"));
        assert!(reg.unsubscribe(&bus("7"), &conn.id));
        assert_eq!(snapshot.len(), 1);
        assert!(reg.subscribers_of(&bus("7")).is_empty());
    }

    #[test]
    fn global_disabled_by_default() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        assert_matches!(
            reg.subscribe_global(conn),
            Err(AdmissionError::GlobalChannelDisabled)
        );
        assert_eq!(reg.global_count(), 0);
    }

    #[test]
    fn global_channel_capacity_and_recipients() {
        let reg = SubscriptionRegistry::new(RegistryLimits {
            per_bus: 5,
            global_channel: true,
            global_capacity: 1,
        });
        let (watcher, _rx1) = make_connection();
        let (viewer, _rx2) = make_connection();
        let (late, _rx3) = make_connection();
        assert_matches!(reg.subscribe_global(Arc::clone(&watcher)), Ok(Admission::Added));
        assert_matches!(
            reg.subscribe_global(Arc::clone(&watcher)),
            Ok(Admission::AlreadySubscribed)
        );
        assert_matches!(
            reg.subscribe_global(late),
            Err(AdmissionError::Full { capacity: 1 })
        );
        let _ = reg.subscribe(&bus("3"), Arc::clone(&viewer), &student()).unwrap();

        let recipients = reg.recipients(&bus("3"));
        assert_eq!(recipients.len(), 2);
        assert!(
            recipients
                .iter()
                .any(|(k, c)| *k == ChannelKey::Global && c.id == watcher.id)
        );
        assert!(
            recipients
                .iter()
                .any(|(k, c)| *k == ChannelKey::Bus(bus("3")) && c.id == viewer.id)
        );
        assert_eq!(reg.recipients(&bus("4")).len(), 1);

        assert!(reg.release(&ChannelKey::Global, &watcher.id));
        assert!(!reg.unsubscribe_global(&watcher.id));
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn recipients_of_unknown_bus_is_empty() {
        let reg = registry(5);
        assert!(reg.recipients(&bus("8")).is_empty());
    }

    #[test]
    fn release_routes_to_bus_channel() {
        let reg = registry(5);
        let (conn, _rx) = make_connection();
        let _ = reg.subscribe(&bus("9"), Arc::clone(&conn), &student()).unwrap();
        assert!(reg.release(&ChannelKey::Bus(bus("9")), &conn.id));
        assert_eq!(reg.channel_count(), 0);
    }

    #[test]
    fn concurrent_subscribers_never_exceed_capacity() {
        let reg = Arc::new(registry(5));
        let results: Vec<_> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16)
                .map(|_| {
                    let reg = Arc::clone(&reg);
                    scope.spawn(move || {
                        let (conn, rx) = make_connection();
                        (reg.subscribe(&bus("7"), conn, &student()), rx)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let admitted = results.iter().filter(|(r, _)| r.is_ok()).count();
        let full = results
            .iter()
            .filter(|(r, _)| matches!(r, Err(AdmissionError::Full { .. })))
            .count();
        assert_eq!(admitted, 5);
        assert_eq!(full, 11);
        assert_eq!(reg.subscriber_count(&bus("7")), 5);
    }

    #[test]
    fn admission_error_labels() {
        assert_eq!(AdmissionError::Unauthorized("driver".into()).label(), "unauthorized");
        assert_eq!(AdmissionError::Full { capacity: 5 }.label(), "full");
        assert_eq!(AdmissionError::GlobalChannelDisabled.label(), "global_disabled");
        assert_eq!(ChannelKey::Bus(bus("7")).to_string(), "bus:7");
        assert_eq!(ChannelKey::Global.to_string(), "global");
    }

    proptest! {
        #[test]
        fn capacity_invariant_holds(
            capacity in 1usize..8,
            ops in proptest::collection::vec((0usize..3, 0usize..12, any::<bool>()), 0..64),
        ) {
            let reg = registry(capacity);
            let buses = ["a", "b", "c"];
            let pool: Vec<_> = (0..12).map(|_| make_connection()).collect();

            for (b, c, subscribe) in ops {
                let bus_id = bus(buses[b]);
                let (conn, _) = &pool[c];
                if subscribe {
                    let _ = reg.subscribe(&bus_id, Arc::clone(conn), &student());
                } else {
                    let _ = reg.unsubscribe(&bus_id, &conn.id);
                }
                for name in buses {
                    let count = reg.subscriber_count(&bus(name));
                    prop_assert!(count <= capacity);
                }
                for active in reg.active_buses() {
                    prop_assert!(reg.subscriber_count(&active) > 0);
                }
            }
        }
    }
}
