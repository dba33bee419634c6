//! # courier-server
//!
//! The Courier realtime chat server: credential gate, WebSocket endpoint,
//! envelope dispatch, and Prometheus metrics over the `courier-core`
//! engine.

pub mod auth;
pub mod config;
pub mod handlers;
pub mod metrics;

pub use auth::{AuthError, Claims, CredentialGate};
pub use config::Config;
pub use handlers::{run_server, serve, AppState};
