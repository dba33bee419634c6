//! # courier-client
//!
//! Consumer-side session manager for the Courier realtime chat engine.
//!
//! A [`Session`] owns one outbound WebSocket connection, exposes a
//! connection-status state machine through a watch channel, and
//! auto-reconnects with a bounded retry count and a fixed delay. Sends are
//! rejected, not queued, while the session is anything but connected.
//!
//! ```rust,ignore
//! use courier_client::{Session, SessionConfig};
//! use courier_protocol::ClientEnvelope;
//!
//! let (session, mut events) = Session::connect(SessionConfig::new(
//!     "ws://127.0.0.1:8081/ws",
//!     "<bearer token>",
//! ));
//!
//! while let Some(envelope) = events.recv().await {
//!     // handle server envelopes
//! }
//! ```

pub mod session;

pub use session::{ReconnectPolicy, Session, SessionConfig, SessionError, SessionStatus};
