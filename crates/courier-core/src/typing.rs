//! Typing signal debounce.
//!
//! Each (chat, user) pair owns at most one countdown timer. Every
//! keystroke signal re-emits a "typing started" envelope to the other
//! participant and re-arms the countdown; when it elapses without a new
//! signal, a single trailing "typing stopped" envelope is emitted. The
//! timer is cancelled on an explicit stop signal and on connection close,
//! so it can never fire against a conversation whose sender is gone.

use std::sync::Arc;
use std::time::Duration;

use courier_protocol::ServerEnvelope;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::trace;

use crate::registry::Registry;

/// Default idle countdown matching the client-side burst cadence.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(2);

type TypingKey = (String, String);

struct TypingSession {
    other_user_id: String,
    timer: JoinHandle<()>,
}

/// Debounces keystroke-level typing signals into started/stopped pairs.
pub struct TypingTracker {
    registry: Arc<Registry>,
    sessions: Arc<DashMap<TypingKey, TypingSession>>,
    idle_timeout: Duration,
}

impl TypingTracker {
    /// Create a tracker that emits through the given registry.
    #[must_use]
    pub fn new(registry: Arc<Registry>, idle_timeout: Duration) -> Self {
        Self {
            registry,
            sessions: Arc::new(DashMap::new()),
            idle_timeout,
        }
    }

    /// Number of armed countdown timers.
    #[must_use]
    pub fn active(&self) -> usize {
        self.sessions.len()
    }

    /// Process a keystroke signal: emit "started" to the other participant
    /// and (re)arm the countdown for this (chat, user) pair.
    pub fn keystroke(&self, chat_id: &str, user_id: &str, other_user_id: &str) {
        if let Some(other) = self.registry.lookup(other_user_id) {
            other.deliver(ServerEnvelope::typing(chat_id, user_id, true));
        }
        self.arm(chat_id, user_id, other_user_id);
    }

    /// Process an explicit stop signal: cancel the countdown and emit
    /// "stopped" to the other participant immediately.
    pub fn stop(&self, chat_id: &str, user_id: &str, other_user_id: &str) {
        let key = (chat_id.to_string(), user_id.to_string());
        if let Some((_, session)) = self.sessions.remove(&key) {
            session.timer.abort();
        }
        if let Some(other) = self.registry.lookup(other_user_id) {
            other.deliver(ServerEnvelope::typing(chat_id, user_id, false));
        }
    }

    /// A connection closed: cancel all of that user's countdowns and emit
    /// each trailing "stopped" now rather than letting a timer fire after
    /// the close.
    pub fn clear_user(&self, user_id: &str) {
        let keys: Vec<TypingKey> = self
            .sessions
            .iter()
            .filter(|entry| entry.key().1 == user_id)
            .map(|entry| entry.key().clone())
            .collect();

        for key in keys {
            if let Some(((chat_id, typist), session)) = self.sessions.remove(&key) {
                session.timer.abort();
                if let Some(other) = self.registry.lookup(&session.other_user_id) {
                    other.deliver(ServerEnvelope::typing(&chat_id, &typist, false));
                }
            }
        }
    }

    fn arm(&self, chat_id: &str, user_id: &str, other_user_id: &str) {
        let key = (chat_id.to_string(), user_id.to_string());

        if let Some((_, previous)) = self.sessions.remove(&key) {
            previous.timer.abort();
        }

        let registry = Arc::clone(&self.registry);
        let sessions = Arc::clone(&self.sessions);
        let idle_timeout = self.idle_timeout;
        let (chat, typist, other) = (
            chat_id.to_string(),
            user_id.to_string(),
            other_user_id.to_string(),
        );

        trace!(chat = %chat_id, user = %user_id, "typing countdown armed");

        let timer = tokio::spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            sessions.remove(&(chat.clone(), typist.clone()));
            if let Some(recipient) = registry.lookup(&other) {
                recipient.deliver(ServerEnvelope::typing(&chat, &typist, false));
            }
        });

        self.sessions.insert(
            key,
            TypingSession {
                other_user_id: other_user_id.to_string(),
                timer,
            },
        );
    }
}
