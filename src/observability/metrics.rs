//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Describe the multiplexer metrics
//! - Expose a Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `mux_connections_accepted_total` (counter): connections accepted
//! - `mux_connections_matched_total` (counter): by group index
//! - `mux_connections_unmatched_total` (counter): closed without a match
//! - `mux_accept_errors_total` (counter): failed accepts
//! - `mux_active_connections` (gauge): tracked connections
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Without an installed recorder every update is a no-op

use std::net::SocketAddr;

use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint on `addr` and describe our metrics.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    describe();
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

fn describe() {
    describe_counter!("mux_connections_accepted_total", "Connections accepted by the multiplexer");
    describe_counter!("mux_connections_matched_total", "Connections handed to a matcher group");
    describe_counter!("mux_connections_unmatched_total", "Connections closed because no group matched");
    describe_counter!("mux_accept_errors_total", "Failed accept calls");
    describe_gauge!("mux_active_connections", "Connections currently tracked");
}
