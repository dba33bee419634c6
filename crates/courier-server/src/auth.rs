//! The credential gate.
//!
//! Connections present an opaque bearer credential (a JWT) as a query
//! parameter. The gate verifies signature and expiry, then resolves the
//! subject to a [`Principal`] through the cache, falling back to the
//! durable store on a miss and populating the cache with a bounded
//! time-to-live on fill.

use std::sync::Arc;
use std::time::Duration;

use courier_core::store::{user_key, Cache, DurableStore, StoreError};
use courier_core::Principal;
use courier_protocol::close_code;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Claims carried by a bearer credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id).
    pub sub: String,
    /// Expiration time (unix seconds).
    pub exp: i64,
    /// Issued-at time (unix seconds).
    pub iat: i64,
}

/// Authentication failures. Each maps to a distinct close code.
#[derive(Debug, Error)]
pub enum AuthError {
    /// No credential was supplied.
    #[error("authentication required")]
    MissingCredential,

    /// The credential failed signature or expiry verification.
    #[error("invalid authentication")]
    InvalidCredential,

    /// The credential verified but its subject no longer exists.
    #[error("invalid authentication")]
    UnknownSubject,

    /// The durable store could not answer.
    #[error("internal server error")]
    Store(#[from] StoreError),
}

impl AuthError {
    /// The WebSocket close code for this failure.
    #[must_use]
    pub fn close_code(&self) -> u16 {
        match self {
            AuthError::MissingCredential => close_code::AUTH_REQUIRED,
            AuthError::InvalidCredential | AuthError::UnknownSubject => close_code::INVALID_AUTH,
            AuthError::Store(_) => close_code::INTERNAL_ERROR,
        }
    }
}

/// Validates bearer credentials and resolves principals.
pub struct CredentialGate {
    decoding_key: DecodingKey,
    validation: Validation,
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn Cache>,
    cache_ttl: Duration,
}

impl CredentialGate {
    /// Create a gate verifying against the given HMAC secret.
    #[must_use]
    pub fn new(
        secret: &str,
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn Cache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
            store,
            cache,
            cache_ttl,
        }
    }

    /// Authenticate a connection-time credential.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingCredential`] for an absent or empty
    /// token, [`AuthError::InvalidCredential`] for a bad signature or
    /// expired token, [`AuthError::UnknownSubject`] when the subject has
    /// been deleted, and [`AuthError::Store`] when the durable store
    /// cannot answer.
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        let token = token
            .filter(|token| !token.is_empty())
            .ok_or(AuthError::MissingCredential)?;

        let data =
            decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(|err| {
                debug!(error = %err, "credential rejected");
                AuthError::InvalidCredential
            })?;

        self.resolve_principal(&data.claims.sub).await
    }

    /// Cache-assisted principal lookup, populating the cache on fill.
    async fn resolve_principal(&self, subject: &str) -> Result<Principal, AuthError> {
        let key = user_key(subject);

        match self.cache.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(principal) => return Ok(principal),
                // A corrupt entry falls through to the durable store.
                Err(err) => warn!(user = %subject, error = %err, "discarding bad cached principal"),
            },
            Ok(None) => {}
            Err(err) => warn!(user = %subject, error = %err, "principal cache read failed"),
        }

        let principal = self
            .store
            .find_user_by_id(subject)
            .await?
            .ok_or(AuthError::UnknownSubject)?;

        match serde_json::to_string(&principal) {
            Ok(raw) => {
                if let Err(err) = self.cache.set(&key, &raw, Some(self.cache_ttl)).await {
                    warn!(user = %subject, error = %err, "principal cache fill failed");
                }
            }
            Err(err) => warn!(user = %subject, error = %err, "principal not cacheable"),
        }

        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::memory::{MemoryCache, MemoryStore};
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SECRET: &str = "test-secret";

    fn token_for(user_id: &str, ttl_secs: i64) -> String {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        let claims = Claims {
            sub: user_id.to_string(),
            exp: now + ttl_secs,
            iat: now,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap()
    }

    fn principal(id: &str) -> Principal {
        Principal {
            id: id.into(),
            email: format!("{id}@example.com"),
            username: id.into(),
        }
    }

    fn gate() -> (CredentialGate, Arc<MemoryStore>, Arc<MemoryCache>) {
        let store = Arc::new(MemoryStore::new());
        let cache = Arc::new(MemoryCache::new());
        let gate = CredentialGate::new(
            SECRET,
            store.clone() as Arc<dyn DurableStore>,
            cache.clone() as Arc<dyn Cache>,
            Duration::from_secs(3600),
        );
        (gate, store, cache)
    }

    #[tokio::test]
    async fn test_valid_credential() {
        let (gate, store, _cache) = gate();
        store.insert_user(principal("alice"));

        let resolved = gate
            .authenticate(Some(&token_for("alice", 3600)))
            .await
            .unwrap();
        assert_eq!(resolved.id, "alice");
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let (gate, _store, _cache) = gate();
        for token in [None, Some("")] {
            let err = gate.authenticate(token).await.unwrap_err();
            assert!(matches!(err, AuthError::MissingCredential));
            assert_eq!(err.close_code(), close_code::AUTH_REQUIRED);
        }
    }

    #[tokio::test]
    async fn test_garbage_credential() {
        let (gate, _store, _cache) = gate();
        let err = gate.authenticate(Some("not-a-jwt")).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
        assert_eq!(err.close_code(), close_code::INVALID_AUTH);
    }

    #[tokio::test]
    async fn test_expired_credential() {
        let (gate, store, _cache) = gate();
        store.insert_user(principal("alice"));

        // Well past the default validation leeway.
        let err = gate
            .authenticate(Some(&token_for("alice", -3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::InvalidCredential));
    }

    #[tokio::test]
    async fn test_deleted_subject() {
        let (gate, _store, _cache) = gate();
        let err = gate
            .authenticate(Some(&token_for("ghost", 3600)))
            .await
            .unwrap_err();
        assert!(matches!(err, AuthError::UnknownSubject));
        assert_eq!(err.close_code(), close_code::INVALID_AUTH);
    }

    #[tokio::test]
    async fn test_cache_fill_and_hit() {
        let (gate, store, cache) = gate();
        store.insert_user(principal("alice"));

        gate.authenticate(Some(&token_for("alice", 3600)))
            .await
            .unwrap();
        assert!(cache.get(&user_key("alice")).await.unwrap().is_some());

        // A subsequent authentication is served from the cache even after
        // the store forgets the user.
        store.remove_user("alice");
        let resolved = gate
            .authenticate(Some(&token_for("alice", 3600)))
            .await
            .unwrap();
        assert_eq!(resolved.id, "alice");
    }
}
