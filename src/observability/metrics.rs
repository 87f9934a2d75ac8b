//! Metrics collection and exposition.
//!
//! # Metrics
//! - `hostgate_requests_total` (counter): requests by listener and status
//! - `hostgate_request_duration_seconds` (histogram): request latency per listener (`tls`, `plaintext`)
//! - `hostgate_handshakes_rejected_total` (counter): SNI lookups that failed
//! - `hostgate_dispatch_failures_total` (counter): handler errors and panics
//! - `hostgate_challenges_served_total` (counter): HTTP-01 key authorizations served
//! - `hostgate_renewals_total` (counter): renewal runs by outcome
//! - `hostgate_active_connections` (gauge): open plaintext connections
//!
//! Recording is a no-op until `init_metrics` installs the exporter.

use std::net::SocketAddr;
use std::time::Instant;

use metrics_exporter_prometheus::PrometheusBuilder;

/// Install the Prometheus recorder and its scrape endpoint.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics endpoint listening"),
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

pub fn record_request(listener: &'static str, status: u16, start: Instant) {
    metrics::counter!(
        "hostgate_requests_total",
        "listener" => listener,
        "status" => status.to_string()
    )
    .increment(1);
    metrics::histogram!("hostgate_request_duration_seconds", "listener" => listener)
        .record(start.elapsed().as_secs_f64());
}

pub fn record_handshake_rejected(reason: &'static str) {
    metrics::counter!("hostgate_handshakes_rejected_total", "reason" => reason).increment(1);
}

pub fn record_dispatch_failure(kind: &'static str) {
    metrics::counter!("hostgate_dispatch_failures_total", "kind" => kind).increment(1);
}

pub fn record_challenge_served(hostname: &str) {
    metrics::counter!("hostgate_challenges_served_total", "hostname" => hostname.to_string())
        .increment(1);
}

pub fn record_renewal(outcome: &'static str) {
    metrics::counter!("hostgate_renewals_total", "outcome" => outcome).increment(1);
}

pub fn record_active_connections(count: usize) {
    metrics::gauge!("hostgate_active_connections").set(count as f64);
}
