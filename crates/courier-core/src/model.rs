//! Domain records owned by the durable store.
//!
//! These types are read-only to the core; the store creates and owns them.

use serde::{Deserialize, Serialize};

/// An authenticated user. Immutable per session once authenticated; cached
/// by the credential gate with a bounded time-to-live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub username: String,
}

/// A two-party chat pairing, fetched by id to resolve the other
/// participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub user1_id: String,
    pub user2_id: String,
}

impl ChatSession {
    /// The participant that is not `user_id`.
    ///
    /// A sender id that matches neither participant resolves to `user1_id`,
    /// the same fallthrough the pairing lookup in handlers guards against.
    #[must_use]
    pub fn other_participant(&self, user_id: &str) -> &str {
        if self.user1_id == user_id {
            &self.user2_id
        } else {
            &self.user1_id
        }
    }

    /// Whether `user_id` is one of the two participants.
    #[must_use]
    pub fn involves(&self, user_id: &str) -> bool {
        self.user1_id == user_id || self.user2_id == user_id
    }

    /// Whether this chat pairs exactly `a` and `b`, in either order.
    #[must_use]
    pub fn pairs(&self, a: &str, b: &str) -> bool {
        (self.user1_id == a && self.user2_id == b) || (self.user1_id == b && self.user2_id == a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chat() -> ChatSession {
        ChatSession {
            id: "chat-1".into(),
            user1_id: "alice".into(),
            user2_id: "bob".into(),
        }
    }

    #[test]
    fn test_other_participant() {
        let chat = chat();
        assert_eq!(chat.other_participant("alice"), "bob");
        assert_eq!(chat.other_participant("bob"), "alice");
    }

    #[test]
    fn test_pairs() {
        let chat = chat();
        assert!(chat.pairs("alice", "bob"));
        assert!(chat.pairs("bob", "alice"));
        assert!(!chat.pairs("alice", "carol"));
        assert!(chat.involves("bob"));
        assert!(!chat.involves("carol"));
    }
}
