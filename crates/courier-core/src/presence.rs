//! Presence: online/offline state plus last-seen timestamps.
//!
//! A user is online iff the registry holds a live connection for them.
//! On disconnect a last-seen timestamp is written to the cache *before*
//! the registry entry is removed, so a presence query racing the
//! disconnect observes either the old online state or the fresh
//! last-seen record, never neither.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::registry::Registry;
use crate::store::{last_seen_key, Cache};

/// Current unix time in milliseconds.
#[must_use]
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}

/// Answer to a presence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceStatus {
    /// Whether the user has a live connection right now.
    pub online: bool,
    /// Last recorded disconnect time, unix milliseconds. Informational;
    /// only populated when the user is offline and a disconnect was
    /// recorded.
    pub last_seen: Option<u64>,
}

/// Derives presence from the registry with a cache-backed last-seen
/// fallback.
pub struct PresenceTracker {
    registry: Arc<Registry>,
    cache: Arc<dyn Cache>,
}

impl PresenceTracker {
    /// Create a tracker over the given registry and cache.
    #[must_use]
    pub fn new(registry: Arc<Registry>, cache: Arc<dyn Cache>) -> Self {
        Self { registry, cache }
    }

    /// Record a disconnect: write the last-seen timestamp, then remove the
    /// registry entry.
    ///
    /// The write is best effort; a cache failure is logged and the
    /// unregistration proceeds regardless.
    pub async fn disconnect(&self, user_id: &str, connection_id: &str) {
        let now = unix_millis();
        if let Err(err) = self
            .cache
            .set(&last_seen_key(user_id), &now.to_string(), None)
            .await
        {
            warn!(user = %user_id, error = %err, "last-seen write failed");
        }
        self.registry.unregister(user_id, connection_id);
        debug!(user = %user_id, last_seen = now, "disconnect recorded");
    }

    /// Answer "is this user reachable now".
    ///
    /// Checks the registry first; offline users fall back to the cached
    /// last-seen timestamp, which is returned as informational data
    /// without any freshness-threshold interpretation.
    pub async fn query(&self, user_id: &str) -> PresenceStatus {
        if self.registry.is_online(user_id) {
            return PresenceStatus {
                online: true,
                last_seen: None,
            };
        }

        let last_seen = match self.cache.get(&last_seen_key(user_id)).await {
            Ok(value) => value.and_then(|raw| raw.parse().ok()),
            Err(err) => {
                warn!(user = %user_id, error = %err, "last-seen read failed");
                None
            }
        };

        PresenceStatus {
            online: false,
            last_seen,
        }
    }
}
