//! Collaborator boundaries: the durable store and the cache.
//!
//! Both are external services as far as this engine is concerned; the core
//! only depends on the operation signatures below. The durable store owns
//! users, chats, and messages. The cache is a best-effort, expiring
//! key/value accelerator and invalidation target, never a source of truth.

use std::time::Duration;

use async_trait::async_trait;
use courier_protocol::Message;
use thiserror::Error;

use crate::model::{ChatSession, Principal};

/// Errors surfaced by a collaborator.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or answered with a failure.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Any other collaborator failure.
    #[error("{0}")]
    Other(String),
}

/// Ordering of a message listing by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrder {
    Ascending,
    Descending,
}

/// The durable store for users, chats, and messages.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Resolve a credential subject to its user record.
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<Principal>, StoreError>;

    /// Persist a chat message. The store assigns the id and creation
    /// timestamp; the message is immutable once created.
    async fn create_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, StoreError>;

    /// Fetch a chat pairing by id.
    async fn find_chat_by_id(&self, chat_id: &str) -> Result<Option<ChatSession>, StoreError>;

    /// Fetch the chat pairing two users, in either order.
    async fn find_chat_between(
        &self,
        user_id: &str,
        other_user_id: &str,
    ) -> Result<Option<ChatSession>, StoreError>;

    /// List a chat's messages ordered by creation time, bounded to `limit`
    /// rows taken from the ordered set.
    async fn list_chat_messages(
        &self,
        chat_id: &str,
        order: MessageOrder,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;
}

/// The expiring key/value cache collaborator.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Read a value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Delete a value. Deleting an absent key is not an error.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Cache key for a cached principal.
#[must_use]
pub fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

/// Cache key for a cached chat snapshot.
#[must_use]
pub fn chat_key(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

/// Cache key for a user's last-seen timestamp.
#[must_use]
pub fn last_seen_key(user_id: &str) -> String {
    format!("lastSeen:{user_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_keys() {
        assert_eq!(user_key("u1"), "user:u1");
        assert_eq!(chat_key("c1"), "chat:c1");
        assert_eq!(last_seen_key("u1"), "lastSeen:u1");
    }
}
