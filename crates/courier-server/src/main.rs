//! # Courier Server
//!
//! Realtime connection, routing, and presence server for two-party chats.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with custom config
//! courier   # reads courier.toml, /etc/courier/courier.toml, ...
//!
//! # Run with environment variables
//! COURIER_PORT=8081 COURIER_HOST=0.0.0.0 courier
//! ```

use std::sync::Arc;

use anyhow::Result;
use courier_core::memory::{MemoryCache, MemoryStore};
use courier_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;

    tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Standalone mode runs on the in-memory reference adapters; deployments
    // wire database/cache-backed implementations of the same traits here.
    let store = Arc::new(MemoryStore::new());
    let cache = Arc::new(MemoryCache::new());

    handlers::run_server(config, store, cache).await?;

    Ok(())
}
