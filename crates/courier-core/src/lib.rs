//! # courier-core
//!
//! Core engine for the Courier realtime chat server: the connection
//! registry, presence tracking, typing debounce, and the collaborator
//! boundaries to the durable store and cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Connection │────▶│  Registry   │────▶│  Presence   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Typing    │     │ Store/Cache │
//!                     └─────────────┘     └─────────────┘
//! ```
//!
//! The registry is the source of truth for "is this user reachable now":
//! at most one live connection per user id, last-registered-wins. Presence
//! derives online/last-seen state from connection lifecycle events, and the
//! typing tracker turns keystroke bursts into debounced started/stopped
//! signals.

pub mod memory;
pub mod model;
pub mod presence;
pub mod registry;
pub mod store;
pub mod typing;

pub use model::{ChatSession, Principal};
pub use presence::{unix_millis, PresenceStatus, PresenceTracker};
pub use registry::{ConnectionHandle, Outbound, Registry};
pub use store::{Cache, DurableStore, MessageOrder, StoreError};
pub use typing::TypingTracker;
