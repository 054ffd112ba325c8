//! Structured logging.
//!
//! # Responsibilities
//! - Initialize the tracing subscriber
//! - Emit one access-log event per completed request
//!
//! # Design Decisions
//! - `RUST_LOG` wins over the configured level
//! - JSON format for production, pretty format for development

use std::net::SocketAddr;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::app::Protocol;
use crate::config::{LogFormat, ObservabilityConfig};

/// Install the global subscriber. Fails if one is already installed or the
/// configured level does not parse.
pub fn init_logging(config: &ObservabilityConfig) -> Result<(), String> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .map_err(|e| format!("invalid log level {:?}: {e}", config.log_level))?,
    };

    let layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(filter)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|e| e.to_string())
}

/// Fields of one access-log line.
#[derive(Debug)]
pub struct AccessRecord<'a> {
    pub request_id: Uuid,
    pub method: &'a str,
    pub path: &'a str,
    pub status: u16,
    pub bytes: u64,
    pub duration: Duration,
    pub peer: SocketAddr,
    pub protocol: Protocol,
}

pub fn log_access(record: &AccessRecord<'_>) {
    tracing::info!(
        target: "access",
        request_id = %record.request_id,
        method = record.method,
        path = record.path,
        status = record.status,
        bytes = record.bytes,
        duration_ms = record.duration.as_secs_f64() * 1000.0,
        peer = %record.peer,
        protocol = record.protocol.as_str(),
        "request completed"
    );
    crate::observability::metrics::record_request(record.protocol, record.status, record.duration);
}
