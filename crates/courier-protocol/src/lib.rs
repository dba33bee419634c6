//! # courier-protocol
//!
//! Wire protocol definitions for the Courier realtime chat engine.
//!
//! Every message exchanged over a live connection is an *envelope*: a JSON
//! text frame of the shape `{"type": <string>, "payload": <object>}`.
//! Because several envelope types carry different payloads depending on
//! direction, the protocol is split into [`ClientEnvelope`] (client to
//! server) and [`ServerEnvelope`] (server to client).
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ClientEnvelope};
//!
//! let envelope = ClientEnvelope::join("chat-1");
//! let encoded = codec::encode_client(&envelope).unwrap();
//! let decoded = codec::decode_client(&encoded).unwrap();
//! assert_eq!(envelope, decoded);
//! ```

pub mod codec;
pub mod envelope;

pub use codec::ProtocolError;
pub use envelope::{
    close_code, ClientEnvelope, ConnectionStatus, Message, ServerEnvelope,
};
