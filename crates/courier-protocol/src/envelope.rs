//! Envelope types for the Courier protocol.
//!
//! Envelopes are the only unit of exchange on a live connection. They are
//! not numbered or acknowledged; delivery is at-most-once per connected
//! recipient.

use serde::{Deserialize, Serialize};

/// WebSocket close codes used when a connection is rejected or torn down.
///
/// Each authentication / protocol failure cause maps to a distinct
/// machine-readable code so clients can tell them apart.
pub mod close_code {
    /// Clean shutdown.
    pub const NORMAL: u16 = 1000;
    /// No credential was supplied at connection time.
    pub const AUTH_REQUIRED: u16 = 4001;
    /// The credential was invalid, expired, or names a deleted subject.
    pub const INVALID_AUTH: u16 = 4002;
    /// The connection sent something unsalvageable.
    pub const INVALID_MESSAGE: u16 = 4003;
    /// Server-side failure while establishing the connection.
    pub const INTERNAL_ERROR: u16 = 4500;
}

/// A persisted chat message as it appears on the wire.
///
/// Messages are created by the durable store and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Store-assigned message identifier.
    pub id: String,
    /// The chat this message belongs to.
    pub chat_id: String,
    /// The user who sent it.
    pub sender_id: String,
    /// Message body.
    pub content: String,
    /// Creation time in unix milliseconds, assigned by the store.
    pub created_at: u64,
}

/// Connection lifecycle status reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
}

/// An envelope sent from a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum ClientEnvelope {
    /// Join a chat and request its history replay.
    Join { chat_id: String },

    /// Send a chat message.
    Chat {
        chat_id: String,
        content: String,
        sender_id: String,
    },

    /// Keystroke-level typing signal. `is_typing: false` ends the burst
    /// explicitly instead of waiting for the server-side debounce.
    Typing {
        chat_id: String,
        user_id: String,
        is_typing: bool,
    },

    /// Presence poll: is `other_user_id` reachable right now?
    Online {
        user_id: String,
        other_user_id: String,
    },
}

impl ClientEnvelope {
    /// The wire type tag for this envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ClientEnvelope::Join { .. } => "join",
            ClientEnvelope::Chat { .. } => "chat",
            ClientEnvelope::Typing { .. } => "typing",
            ClientEnvelope::Online { .. } => "online",
        }
    }

    /// Create a new Join envelope.
    #[must_use]
    pub fn join(chat_id: impl Into<String>) -> Self {
        ClientEnvelope::Join {
            chat_id: chat_id.into(),
        }
    }

    /// Create a new Chat envelope.
    #[must_use]
    pub fn chat(
        chat_id: impl Into<String>,
        content: impl Into<String>,
        sender_id: impl Into<String>,
    ) -> Self {
        ClientEnvelope::Chat {
            chat_id: chat_id.into(),
            content: content.into(),
            sender_id: sender_id.into(),
        }
    }

    /// Create a new Typing envelope.
    #[must_use]
    pub fn typing(chat_id: impl Into<String>, user_id: impl Into<String>, is_typing: bool) -> Self {
        ClientEnvelope::Typing {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            is_typing,
        }
    }

    /// Create a new Online poll envelope.
    #[must_use]
    pub fn online(user_id: impl Into<String>, other_user_id: impl Into<String>) -> Self {
        ClientEnvelope::Online {
            user_id: user_id.into(),
            other_user_id: other_user_id.into(),
        }
    }
}

/// An envelope sent from the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "lowercase",
    rename_all_fields = "camelCase"
)]
pub enum ServerEnvelope {
    /// A delivered or replayed chat message.
    Chat { chat_id: String, message: Message },

    /// Typing started/stopped, forwarded to the other participant only.
    Typing {
        chat_id: String,
        user_id: String,
        is_typing: bool,
    },

    /// Presence poll response. `last_seen` is informational and only
    /// present when the user is offline and a disconnect was recorded.
    Online {
        online: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_seen: Option<u64>,
    },

    /// Sent exactly once after successful authentication.
    Connection {
        status: ConnectionStatus,
        user_id: String,
    },

    /// Protocol, validation, or handler error. The connection stays open.
    Error { message: String },
}

impl ServerEnvelope {
    /// The wire type tag for this envelope.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEnvelope::Chat { .. } => "chat",
            ServerEnvelope::Typing { .. } => "typing",
            ServerEnvelope::Online { .. } => "online",
            ServerEnvelope::Connection { .. } => "connection",
            ServerEnvelope::Error { .. } => "error",
        }
    }

    /// Create a new Chat envelope.
    #[must_use]
    pub fn chat(chat_id: impl Into<String>, message: Message) -> Self {
        ServerEnvelope::Chat {
            chat_id: chat_id.into(),
            message,
        }
    }

    /// Create a new Typing envelope.
    #[must_use]
    pub fn typing(chat_id: impl Into<String>, user_id: impl Into<String>, is_typing: bool) -> Self {
        ServerEnvelope::Typing {
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            is_typing,
        }
    }

    /// Create a new Online response envelope.
    #[must_use]
    pub fn online(online: bool, last_seen: Option<u64>) -> Self {
        ServerEnvelope::Online { online, last_seen }
    }

    /// Create a new Connection status envelope.
    #[must_use]
    pub fn connection(status: ConnectionStatus, user_id: impl Into<String>) -> Self {
        ServerEnvelope::Connection {
            status,
            user_id: user_id.into(),
        }
    }

    /// Create a new Error envelope.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        ServerEnvelope::Error {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_envelope_kind() {
        assert_eq!(ClientEnvelope::join("c1").kind(), "join");
        assert_eq!(ClientEnvelope::chat("c1", "hi", "u1").kind(), "chat");
        assert_eq!(ClientEnvelope::typing("c1", "u1", true).kind(), "typing");
        assert_eq!(ClientEnvelope::online("u1", "u2").kind(), "online");
    }

    #[test]
    fn test_client_wire_shape() {
        let envelope = ClientEnvelope::chat("chat-1", "hello", "user-1");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(json["type"], "chat");
        assert_eq!(json["payload"]["chatId"], "chat-1");
        assert_eq!(json["payload"]["content"], "hello");
        assert_eq!(json["payload"]["senderId"], "user-1");
    }

    #[test]
    fn test_server_wire_shape() {
        let envelope = ServerEnvelope::connection(ConnectionStatus::Connected, "user-1");
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();

        assert_eq!(json["type"], "connection");
        assert_eq!(json["payload"]["status"], "connected");
        assert_eq!(json["payload"]["userId"], "user-1");
    }

    #[test]
    fn test_online_omits_absent_last_seen() {
        let text = serde_json::to_string(&ServerEnvelope::online(true, None)).unwrap();
        assert!(!text.contains("lastSeen"));

        let text = serde_json::to_string(&ServerEnvelope::online(false, Some(1234))).unwrap();
        assert!(text.contains("\"lastSeen\":1234"));
    }
}
