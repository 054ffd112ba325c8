//! Metrics collection and exposition.
//!
//! # Metrics
//! - `http_requests_total` (counter): requests by protocol, status
//! - `http_request_duration_seconds` (histogram): latency distribution
//! - `connections_active` (gauge): live connections in this worker
//! - `admission_rejections_total` (counter): rejections by reason
//! - `h2_streams_refused_total` (counter): streams over the concurrency limit
//! - `buffer_pool_exhausted_total` (counter): acquire timeouts
//!
//! # Design Decisions
//! - Each worker runs its own exporter; ports are offset by worker id
//! - Label values come from fixed sets, never from client input

use std::net::SocketAddr;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

use crate::app::Protocol;
use crate::error::Rejection;

/// Metrics listener address for a worker: the configured port plus `worker_id`.
pub fn worker_address(base: SocketAddr, worker_id: usize) -> SocketAddr {
    let port = base.port().saturating_add(worker_id as u16);
    SocketAddr::new(base.ip(), port)
}

/// Install the Prometheus recorder and its HTTP listener.
///
/// Must be called from within a tokio runtime.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| e.to_string())?;

    describe_counter!("http_requests_total", "Completed HTTP requests");
    describe_histogram!("http_request_duration_seconds", "Request latency in seconds");
    describe_gauge!("connections_active", "Open client connections");
    describe_counter!("admission_rejections_total", "Connections or requests rejected by admission control");
    describe_counter!("h2_streams_refused_total", "HTTP/2 streams refused over the concurrency limit");
    describe_counter!("buffer_pool_exhausted_total", "Buffer acquisitions that timed out");

    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

pub fn record_request(protocol: Protocol, status: u16, duration: Duration) {
    counter!(
        "http_requests_total",
        "protocol" => protocol.as_str(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_seconds").record(duration.as_secs_f64());
}

pub fn record_rejection(rejection: Rejection) {
    counter!("admission_rejections_total", "reason" => rejection.reason()).increment(1);
}

pub fn record_refused_stream() {
    counter!("h2_streams_refused_total").increment(1);
}
