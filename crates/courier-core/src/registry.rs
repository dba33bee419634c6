//! The connection registry: user identity to live connection.
//!
//! The registry is shared mutable state accessed from every connection's
//! task. Operations are independent per user id, so a sharded concurrent
//! map gives the single-writer-per-key discipline the contract needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use courier_protocol::ServerEnvelope;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

/// A user identifier.
pub type UserId = String;

/// Counter for connection id uniqueness within the same nanosecond.
static CONNECTION_COUNTER: AtomicU64 = AtomicU64::new(0);

fn generate_connection_id() -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos() as u64;
    let counter = CONNECTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("conn_{timestamp:x}_{counter:x}")
}

/// A command for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    /// Serialize and send this envelope.
    Deliver(ServerEnvelope),
    /// Shut the transport down. Sent to a connection that has been
    /// superseded by a newer registration for the same user.
    Close,
}

/// A handle to a live connection, exclusively owned by the registry for
/// its lifetime. Cloning the handle clones the address, not the transport.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    user_id: UserId,
    connection_id: String,
    sender: mpsc::UnboundedSender<Outbound>,
    last_ping_at: Arc<AtomicU64>,
}

impl ConnectionHandle {
    /// Create a handle for a freshly authenticated connection.
    #[must_use]
    pub fn new(user_id: impl Into<UserId>, sender: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id: generate_connection_id(),
            sender,
            last_ping_at: Arc::new(AtomicU64::new(now_millis())),
        }
    }

    /// The user this connection belongs to.
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// The unique id of this connection, distinguishing it from any earlier
    /// or later connection of the same user.
    #[must_use]
    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    /// Queue an envelope for delivery.
    ///
    /// Returns `false` if the connection's writer task is gone; the
    /// envelope is dropped in that case (delivery gaps are not errors).
    pub fn deliver(&self, envelope: ServerEnvelope) -> bool {
        self.sender.send(Outbound::Deliver(envelope)).is_ok()
    }

    /// Ask the connection's writer task to shut the transport down.
    pub fn close(&self) -> bool {
        self.sender.send(Outbound::Close).is_ok()
    }

    /// Record liveness (called when a heartbeat pong arrives).
    pub fn touch(&self) {
        self.last_ping_at.store(now_millis(), Ordering::Relaxed);
    }

    /// Last recorded liveness, unix milliseconds.
    #[must_use]
    pub fn last_ping_at(&self) -> u64 {
        self.last_ping_at.load(Ordering::Relaxed)
    }

    /// Whether no liveness has been recorded within `timeout`.
    #[must_use]
    pub fn is_stale(&self, timeout: Duration) -> bool {
        now_millis().saturating_sub(self.last_ping_at()) > timeout.as_millis() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// The in-memory mapping from user id to its single live connection.
///
/// `register` for an already-present user replaces the entry
/// (last-registered-wins); the displaced handle is returned so the caller
/// can close the superseded transport instead of leaking it. `lookup`
/// never blocks for I/O and `unregister` is idempotent.
#[derive(Debug, Default)]
pub struct Registry {
    connections: DashMap<UserId, ConnectionHandle>,
}

impl Registry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection for its user, replacing any existing entry.
    ///
    /// Returns the displaced handle, if any.
    pub fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let user_id = handle.user_id().to_string();
        let displaced = self.connections.insert(user_id.clone(), handle);
        debug!(
            user = %user_id,
            replaced = displaced.is_some(),
            "connection registered"
        );
        displaced
    }

    /// Look up the live connection for a user.
    #[must_use]
    pub fn lookup(&self, user_id: &str) -> Option<ConnectionHandle> {
        self.connections.get(user_id).map(|entry| entry.clone())
    }

    /// Whether a user has a live connection.
    #[must_use]
    pub fn is_online(&self, user_id: &str) -> bool {
        self.connections.contains_key(user_id)
    }

    /// Remove a user's entry, but only if it still belongs to
    /// `connection_id`. A superseded connection's late cleanup must never
    /// evict its replacement.
    ///
    /// Returns `true` if an entry was removed. Idempotent.
    pub fn unregister(&self, user_id: &str, connection_id: &str) -> bool {
        let removed = self
            .connections
            .remove_if(user_id, |_, handle| handle.connection_id() == connection_id)
            .is_some();
        if removed {
            debug!(user = %user_id, connection = %connection_id, "connection unregistered");
        }
        removed
    }

    /// Number of live connections.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether no connections are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle_for(user: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(user, tx), rx)
    }

    #[test]
    fn test_register_lookup_unregister() {
        let registry = Registry::new();
        let (handle, _rx) = handle_for("alice");
        let connection_id = handle.connection_id().to_string();

        assert!(registry.register(handle).is_none());
        assert!(registry.is_online("alice"));
        assert_eq!(registry.lookup("alice").unwrap().user_id(), "alice");

        assert!(registry.unregister("alice", &connection_id));
        assert!(!registry.is_online("alice"));
        // Idempotent.
        assert!(!registry.unregister("alice", &connection_id));
    }

    #[test]
    fn test_register_replaces_and_returns_displaced() {
        let registry = Registry::new();
        let (first, _rx1) = handle_for("alice");
        let (second, _rx2) = handle_for("alice");
        let first_id = first.connection_id().to_string();
        let second_id = second.connection_id().to_string();

        registry.register(first);
        let displaced = registry.register(second).unwrap();

        assert_eq!(displaced.connection_id(), first_id);
        assert_eq!(registry.lookup("alice").unwrap().connection_id(), second_id);
    }

    #[test]
    fn test_superseded_cleanup_cannot_evict_replacement() {
        let registry = Registry::new();
        let (first, _rx1) = handle_for("alice");
        let (second, _rx2) = handle_for("alice");
        let first_id = first.connection_id().to_string();

        registry.register(first);
        registry.register(second);

        // The old connection's teardown races the new registration.
        assert!(!registry.unregister("alice", &first_id));
        assert!(registry.is_online("alice"));
    }

    #[test]
    fn test_deliver_reaches_writer() {
        let (handle, mut rx) = handle_for("alice");

        assert!(handle.deliver(ServerEnvelope::error("boom")));
        assert!(handle.close());

        assert!(matches!(rx.try_recv(), Ok(Outbound::Deliver(_))));
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
    }

    #[test]
    fn test_unique_connection_ids() {
        let (a, _rx1) = handle_for("alice");
        let (b, _rx2) = handle_for("alice");
        assert_ne!(a.connection_id(), b.connection_id());
    }

    #[test]
    fn test_staleness() {
        let (handle, _rx) = handle_for("alice");
        handle.touch();
        assert!(!handle.is_stale(Duration::from_secs(60)));
        assert!(handle.is_stale(Duration::ZERO) || handle.last_ping_at() == now_millis());
    }
}
