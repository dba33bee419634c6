//! Metrics collection and export for Courier.
//!
//! Uses the `metrics` crate for instrumentation and exports
//! to Prometheus format.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "courier_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "courier_connections_active";
    pub const ENVELOPES_TOTAL: &str = "courier_envelopes_total";
    pub const MESSAGES_PERSISTED_TOTAL: &str = "courier_messages_persisted_total";
    pub const HISTORY_ROWS_REPLAYED_TOTAL: &str = "courier_history_rows_replayed_total";
    pub const TYPING_TIMERS_ACTIVE: &str = "courier_typing_timers_active";
    pub const DISPATCH_SECONDS: &str = "courier_dispatch_seconds";
    pub const ERRORS_TOTAL: &str = "courier_errors_total";
}

/// Initialize the metrics system.
pub fn init_metrics() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since server start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of active connections"
    );
    metrics::describe_counter!(
        names::ENVELOPES_TOTAL,
        "Total number of envelopes processed"
    );
    metrics::describe_counter!(
        names::MESSAGES_PERSISTED_TOTAL,
        "Total number of chat messages persisted"
    );
    metrics::describe_counter!(
        names::HISTORY_ROWS_REPLAYED_TOTAL,
        "Total number of history messages replayed on join"
    );
    metrics::describe_gauge!(
        names::TYPING_TIMERS_ACTIVE,
        "Current number of armed typing countdowns"
    );
    metrics::describe_histogram!(
        names::DISPATCH_SECONDS,
        "Envelope dispatch latency in seconds"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors");

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Record a new authenticated connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a disconnection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed envelope.
pub fn record_envelope(direction: &str) {
    counter!(names::ENVELOPES_TOTAL, "direction" => direction.to_string()).increment(1);
}

/// Record a persisted chat message.
pub fn record_message_persisted() {
    counter!(names::MESSAGES_PERSISTED_TOTAL).increment(1);
}

/// Record history rows replayed to a joining connection.
pub fn record_history_replayed(rows: usize) {
    counter!(names::HISTORY_ROWS_REPLAYED_TOTAL).increment(rows as u64);
}

/// Update the armed typing countdown count.
pub fn set_typing_timers(count: usize) {
    gauge!(names::TYPING_TIMERS_ACTIVE).set(count as f64);
}

/// Record envelope dispatch latency.
pub fn record_dispatch_latency(seconds: f64) {
    histogram!(names::DISPATCH_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(error_type: &str) {
    counter!(names::ERRORS_TOTAL, "type" => error_type.to_string()).increment(1);
}

/// Metrics guard that records disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_guard() {
        // Just test that it doesn't panic
        let _guard = ConnectionMetricsGuard::new();
    }
}
