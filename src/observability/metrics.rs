//! Metrics collection and exposition.
//!
//! # Metrics
//! - `servekit_requests_total` (counter): requests by method, status
//! - `servekit_request_duration_seconds` (histogram): latency by method
//! - `servekit_reloads_total` (counter): hot reloads by outcome
//! - `servekit_panics_total` (counter): handler panics caught
//! - `servekit_watch_reconnects_total` (counter): watch stream reconnects
//!
//! Recording is a no-op until [`init_metrics`] installs the exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

/// Start the Prometheus scrape endpoint on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics endpoint listening");
    Ok(())
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "servekit_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("servekit_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// `outcome` is one of "applied", "failed" or "skipped".
pub fn record_reload(outcome: &'static str) {
    counter!("servekit_reloads_total", "outcome" => outcome).increment(1);
}

pub fn record_panic() {
    counter!("servekit_panics_total").increment(1);
}

pub fn record_watch_reconnect(target: &str) {
    counter!("servekit_watch_reconnects_total", "target" => target.to_string()).increment(1);
}
