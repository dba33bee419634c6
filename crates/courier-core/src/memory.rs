//! In-memory reference adapters for the collaborator traits.
//!
//! These back the standalone binary and the test suites. Deployments that
//! need durability substitute database/cache-backed implementations of the
//! same traits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use courier_protocol::Message;
use dashmap::DashMap;

use crate::model::{ChatSession, Principal};
use crate::presence::unix_millis;
use crate::store::{Cache, DurableStore, MessageOrder, StoreError};

/// An in-memory durable store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<String, Principal>,
    chats: DashMap<String, ChatSession>,
    /// Messages in persistence order.
    messages: Mutex<Vec<Message>>,
    next_message_id: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a user record.
    pub fn insert_user(&self, user: Principal) {
        self.users.insert(user.id.clone(), user);
    }

    /// Remove a user record.
    pub fn remove_user(&self, user_id: &str) {
        self.users.remove(user_id);
    }

    /// Seed a chat pairing.
    pub fn insert_chat(&self, chat: ChatSession) {
        self.chats.insert(chat.id.clone(), chat);
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn find_user_by_id(&self, user_id: &str) -> Result<Option<Principal>, StoreError> {
        Ok(self.users.get(user_id).map(|entry| entry.clone()))
    }

    async fn create_message(
        &self,
        chat_id: &str,
        sender_id: &str,
        content: &str,
    ) -> Result<Message, StoreError> {
        let id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            id: format!("msg_{id}"),
            chat_id: chat_id.to_string(),
            sender_id: sender_id.to_string(),
            content: content.to_string(),
            created_at: unix_millis(),
        };
        self.messages
            .lock()
            .map_err(|_| StoreError::Other("message log poisoned".into()))?
            .push(message.clone());
        Ok(message)
    }

    async fn find_chat_by_id(&self, chat_id: &str) -> Result<Option<ChatSession>, StoreError> {
        Ok(self.chats.get(chat_id).map(|entry| entry.clone()))
    }

    async fn find_chat_between(
        &self,
        user_id: &str,
        other_user_id: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        Ok(self
            .chats
            .iter()
            .find(|entry| entry.pairs(user_id, other_user_id))
            .map(|entry| entry.clone()))
    }

    async fn list_chat_messages(
        &self,
        chat_id: &str,
        order: MessageOrder,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        let log = self
            .messages
            .lock()
            .map_err(|_| StoreError::Other("message log poisoned".into()))?;

        // Persistence order is creation order.
        let mut rows: Vec<Message> = log
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect();
        if order == MessageOrder::Descending {
            rows.reverse();
        }
        rows.truncate(limit);
        Ok(rows)
    }
}

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at
            .map(|deadline| Instant::now() >= deadline)
            .unwrap_or(false)
    }
}

/// An in-memory expiring key/value cache.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, CacheEntry>,
}

impl MemoryCache {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired() {
                return Ok(Some(entry.value.clone()));
            }
        }
        // Expired entries are pruned lazily.
        self.entries.remove_if(key, |_, entry| entry.is_expired());
        Ok(None)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), StoreError> {
        self.entries.insert(
            key.to_string(),
            CacheEntry {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StoreError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.into(),
            email: format!("{id}@example.com"),
            username: id.into(),
        }
    }

    #[tokio::test]
    async fn test_store_users_and_chats() {
        let store = MemoryStore::new();
        store.insert_user(principal("alice"));
        store.insert_chat(ChatSession {
            id: "chat-1".into(),
            user1_id: "alice".into(),
            user2_id: "bob".into(),
        });

        assert!(store.find_user_by_id("alice").await.unwrap().is_some());
        assert!(store.find_user_by_id("carol").await.unwrap().is_none());

        let chat = store.find_chat_between("bob", "alice").await.unwrap();
        assert_eq!(chat.unwrap().id, "chat-1");
        assert!(store
            .find_chat_between("alice", "carol")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_message_listing_order_and_bound() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .create_message("chat-1", "alice", &format!("m{i}"))
                .await
                .unwrap();
        }
        store.create_message("chat-2", "bob", "other").await.unwrap();

        let ascending = store
            .list_chat_messages("chat-1", MessageOrder::Ascending, 3)
            .await
            .unwrap();
        let contents: Vec<_> = ascending.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m0", "m1", "m2"]);

        let descending = store
            .list_chat_messages("chat-1", MessageOrder::Descending, 3)
            .await
            .unwrap();
        let contents: Vec<_> = descending.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["m4", "m3", "m2"]);
    }

    #[tokio::test]
    async fn test_cache_set_get_del() {
        let cache = MemoryCache::new();
        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));

        cache.del("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        // Deleting an absent key is fine.
        cache.del("k").await.unwrap();
    }

    #[tokio::test]
    async fn test_cache_expiry() {
        let cache = MemoryCache::new();
        cache
            .set("k", "v", Some(Duration::ZERO))
            .await
            .unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
    }
}
