//! Codec for encoding and decoding Courier envelopes.
//!
//! Envelopes travel as JSON text frames; the WebSocket layer already
//! delimits messages, so there is no additional framing. Decoding is staged
//! so the router can distinguish a malformed frame from a well-formed frame
//! with an unknown type or an incomplete payload, and report each class
//! differently without dropping the connection.

use serde::Deserialize;
use thiserror::Error;

use crate::envelope::{ClientEnvelope, ServerEnvelope};

/// Maximum accepted envelope size (64 KiB).
pub const MAX_ENVELOPE_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Envelope exceeds the maximum size.
    #[error("envelope size {0} exceeds maximum {MAX_ENVELOPE_SIZE}")]
    TooLarge(usize),

    /// The frame is not a JSON object of shape `{"type", "payload"}`.
    #[error("malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),

    /// The declared type is outside the closed set.
    #[error("unsupported envelope type: {0}")]
    UnknownType(String),

    /// The type is known but the payload is missing required fields.
    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    /// JSON encoding error.
    #[error("encoding error: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Type tags a client is allowed to send.
const CLIENT_KINDS: [&str; 4] = ["join", "chat", "typing", "online"];

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
}

/// Encode a client envelope to a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is oversized.
pub fn encode_client(envelope: &ClientEnvelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(text)
}

/// Encode a server envelope to a JSON text frame.
///
/// # Errors
///
/// Returns an error if serialization fails or the result is oversized.
pub fn encode_server(envelope: &ServerEnvelope) -> Result<String, ProtocolError> {
    let text = serde_json::to_string(envelope).map_err(ProtocolError::Encode)?;
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    Ok(text)
}

/// Decode an inbound frame as a client envelope.
///
/// # Errors
///
/// - [`ProtocolError::TooLarge`] when the frame exceeds the size cap;
/// - [`ProtocolError::Malformed`] when the frame is not a `{type, payload}`
///   JSON object;
/// - [`ProtocolError::UnknownType`] when the type tag is outside the closed
///   set of client envelope kinds;
/// - [`ProtocolError::InvalidPayload`] when the payload is missing required
///   fields for its declared type.
pub fn decode_client(text: &str) -> Result<ClientEnvelope, ProtocolError> {
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }

    match serde_json::from_str::<ClientEnvelope>(text) {
        Ok(envelope) => Ok(envelope),
        Err(err) => Err(classify_client_error(text, err)),
    }
}

/// Decode an inbound frame as a server envelope (consumer side).
///
/// Clients have no use for the finer error classes, so anything that is not
/// a recognizable server envelope is reported as malformed.
///
/// # Errors
///
/// Returns an error if the frame is oversized or not a server envelope.
pub fn decode_server(text: &str) -> Result<ServerEnvelope, ProtocolError> {
    if text.len() > MAX_ENVELOPE_SIZE {
        return Err(ProtocolError::TooLarge(text.len()));
    }
    serde_json::from_str(text).map_err(ProtocolError::Malformed)
}

/// Work out which failure class a rejected client frame belongs to.
fn classify_client_error(text: &str, err: serde_json::Error) -> ProtocolError {
    let raw: RawEnvelope = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(raw_err) => return ProtocolError::Malformed(raw_err),
    };

    match CLIENT_KINDS.iter().copied().find(|kind| raw.kind == *kind) {
        Some(kind) => ProtocolError::InvalidPayload { kind, source: err },
        None => ProtocolError::UnknownType(raw.kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{ConnectionStatus, Message};

    #[test]
    fn test_encode_decode_roundtrip() {
        let envelopes = vec![
            ClientEnvelope::join("chat-1"),
            ClientEnvelope::chat("chat-1", "Hello, world!", "user-1"),
            ClientEnvelope::typing("chat-1", "user-1", true),
            ClientEnvelope::online("user-1", "user-2"),
        ];

        for envelope in envelopes {
            let encoded = encode_client(&envelope).unwrap();
            let decoded = decode_client(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_server_roundtrip() {
        let message = Message {
            id: "msg-1".into(),
            chat_id: "chat-1".into(),
            sender_id: "user-1".into(),
            content: "hi".into(),
            created_at: 1_700_000_000_000,
        };
        let envelopes = vec![
            ServerEnvelope::chat("chat-1", message),
            ServerEnvelope::typing("chat-1", "user-1", false),
            ServerEnvelope::online(false, Some(1_700_000_000_000)),
            ServerEnvelope::connection(ConnectionStatus::Connected, "user-1"),
            ServerEnvelope::error("Chat not found"),
        ];

        for envelope in envelopes {
            let encoded = encode_server(&envelope).unwrap();
            let decoded = decode_server(&encoded).unwrap();
            assert_eq!(envelope, decoded);
        }
    }

    #[test]
    fn test_decode_malformed() {
        for text in ["not json", "{\"type\": 5}", "[]", "{\"payload\": {}}"] {
            match decode_client(text) {
                Err(ProtocolError::Malformed(_)) => {}
                other => panic!("expected Malformed for {text:?}, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_decode_unknown_type() {
        let text = r#"{"type": "presence", "payload": {}}"#;
        match decode_client(text) {
            Err(ProtocolError::UnknownType(kind)) => assert_eq!(kind, "presence"),
            other => panic!("expected UnknownType, got {other:?}"),
        }

        // Server-only tags are not valid inbound types either.
        let text = r#"{"type": "connection", "payload": {}}"#;
        assert!(matches!(
            decode_client(text),
            Err(ProtocolError::UnknownType(_))
        ));
    }

    #[test]
    fn test_decode_invalid_payload() {
        // Known type, missing required fields.
        let text = r#"{"type": "chat", "payload": {"chatId": "c1"}}"#;
        match decode_client(text) {
            Err(ProtocolError::InvalidPayload { kind, .. }) => assert_eq!(kind, "chat"),
            other => panic!("expected InvalidPayload, got {other:?}"),
        }

        // Missing payload entirely.
        let text = r#"{"type": "join"}"#;
        assert!(matches!(
            decode_client(text),
            Err(ProtocolError::InvalidPayload { kind: "join", .. })
        ));
    }

    #[test]
    fn test_oversized_envelope_rejected() {
        let content = "x".repeat(MAX_ENVELOPE_SIZE);
        let encoded = encode_client(&ClientEnvelope::chat("c1", content, "u1"));
        assert!(matches!(encoded, Err(ProtocolError::TooLarge(_))));

        let padding = " ".repeat(MAX_ENVELOPE_SIZE);
        let inbound = format!("{{\"type\": \"join\", \"payload\": {{}}}}{padding}");
        assert!(matches!(
            decode_client(&inbound),
            Err(ProtocolError::TooLarge(_))
        ));
    }
}
