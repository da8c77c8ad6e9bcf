//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gate_requests_total` (counter): requests by method and status
//! - `gate_request_duration_seconds` (histogram): latency distribution
//! - `gate_flow_running` (gauge): requests holding an admission
//! - `gate_flow_blocked` (gauge): requests waiting in a flow queue
//! - `gate_flow_rejected_total` (counter): rejections by reason
//! - `gate_auth_cache_lookups_total` (counter): cache lookups by result
//! - `gate_auth_cache_entries` (gauge): cached authentications
//!
//! Recording is a no-op until a recorder is installed, so unit tests can
//! call into instrumented code freely.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Instant;

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => {
            describe();
            tracing::info!(address = %addr, "Metrics endpoint listening");
        }
        Err(e) => tracing::error!(address = %addr, error = %e, "Failed to install metrics exporter"),
    }
}

fn describe() {
    describe_counter!("gate_requests_total", "Total requests handled by the gateway");
    describe_histogram!(
        "gate_request_duration_seconds",
        "Request latency in seconds, including queueing"
    );
    describe_gauge!("gate_flow_running", "Requests currently admitted by flow control");
    describe_gauge!("gate_flow_blocked", "Requests currently waiting for admission");
    describe_counter!("gate_flow_rejected_total", "Requests rejected by flow control");
    describe_counter!("gate_auth_cache_lookups_total", "Authentication cache lookups");
    describe_gauge!("gate_auth_cache_entries", "Cached authentications");
}

pub fn record_request(method: &str, status: u16, start: Instant) {
    counter!(
        "gate_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("gate_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

pub fn record_flow_running(running: usize) {
    gauge!("gate_flow_running").set(running as f64);
}

pub fn record_flow_blocked(blocked: usize) {
    gauge!("gate_flow_blocked").set(blocked as f64);
}

pub fn record_flow_rejection(reason: &'static str) {
    counter!("gate_flow_rejected_total", "reason" => reason).increment(1);
}

pub fn record_auth_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("gate_auth_cache_lookups_total", "result" => result).increment(1);
}

pub fn record_auth_cache_size(entries: usize) {
    gauge!("gate_auth_cache_entries").set(entries as f64);
}
