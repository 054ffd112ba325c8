//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (sizes > 0, HTTP/2 settings within protocol bounds)
//! - Check that address and CIDR strings parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ServerConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::fmt;
use std::net::SocketAddr;

use crate::config::schema::ServerConfig;
use crate::http2::settings::{MAX_FRAME_SIZE_LIMIT, MAX_WINDOW_SIZE, MIN_FRAME_SIZE};
use crate::security::ip_filter::Cidr;

/// A single semantic problem with a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every section and collect all problems.
pub fn validate_config(config: &ServerConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let listener = &config.listener;
    if listener.workers == 0 {
        errors.push(ValidationError::new("listener.workers", "must be at least 1"));
    }
    if listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be at least 1"));
    }
    if listener.backlog == 0 {
        errors.push(ValidationError::new("listener.backlog", "must be greater than 0"));
    }

    if let Some(tls) = &config.tls {
        if tls.cert_path.is_empty() {
            errors.push(ValidationError::new("tls.cert_path", "must not be empty"));
        }
        if tls.key_path.is_empty() {
            errors.push(ValidationError::new("tls.key_path", "must not be empty"));
        }
    }

    let buffers = &config.buffers;
    if buffers.buffer_size == 0 {
        errors.push(ValidationError::new("buffers.buffer_size", "must be greater than 0"));
    }
    if buffers.large_buffer_size < buffers.buffer_size {
        errors.push(ValidationError::new(
            "buffers.large_buffer_size",
            "must be at least buffers.buffer_size",
        ));
    }
    if buffers.pool_capacity == 0 {
        errors.push(ValidationError::new("buffers.pool_capacity", "must be at least 1"));
    } else if buffers.pool_capacity < listener.max_connections {
        errors.push(ValidationError::new(
            "buffers.pool_capacity",
            "must be at least listener.max_connections",
        ));
    }

    let rate_limit = &config.rate_limit;
    if rate_limit.enabled {
        if !(rate_limit.rate > 0.0) {
            errors.push(ValidationError::new("rate_limit.rate", "must be positive"));
        }
        if !(rate_limit.burst >= 1.0) {
            errors.push(ValidationError::new("rate_limit.burst", "must be at least 1"));
        }
        if rate_limit.max_entries == 0 {
            errors.push(ValidationError::new("rate_limit.max_entries", "must be at least 1"));
        }
    }

    for (list, entries) in [
        ("ip_filter.allow", &config.ip_filter.allow),
        ("ip_filter.deny", &config.ip_filter.deny),
    ] {
        for entry in entries {
            if let Err(e) = entry.parse::<Cidr>() {
                errors.push(ValidationError::new(list, format!("{entry:?}: {e}")));
            }
        }
    }

    if config.cors.enabled && config.cors.allowed_origins.is_empty() {
        errors.push(ValidationError::new(
            "cors.allowed_origins",
            "must list at least one origin when CORS is enabled",
        ));
    }

    let limits = &config.limits;
    for (field, value) in [
        ("limits.max_head_size", limits.max_head_size),
        ("limits.max_headers", limits.max_headers),
        ("limits.max_header_name", limits.max_header_name),
        ("limits.max_header_value", limits.max_header_value),
        ("limits.max_segment_len", limits.max_segment_len),
    ] {
        if value == 0 {
            errors.push(ValidationError::new(field, "must be greater than 0"));
        }
    }

    let http1 = &config.http1;
    if http1.max_requests == 0 {
        errors.push(ValidationError::new("http1.max_requests", "must be at least 1"));
    }
    if http1.max_pipeline_depth == 0 {
        errors.push(ValidationError::new("http1.max_pipeline_depth", "must be at least 1"));
    }
    if http1.idle_timeout_secs == 0 {
        errors.push(ValidationError::new("http1.idle_timeout_secs", "must be greater than 0"));
    }
    if http1.read_timeout_secs == 0 {
        errors.push(ValidationError::new("http1.read_timeout_secs", "must be greater than 0"));
    }

    let http2 = &config.http2;
    if !(MIN_FRAME_SIZE..=MAX_FRAME_SIZE_LIMIT).contains(&http2.max_frame_size) {
        errors.push(ValidationError::new(
            "http2.max_frame_size",
            format!("must be between {MIN_FRAME_SIZE} and {MAX_FRAME_SIZE_LIMIT}"),
        ));
    }
    if http2.initial_window_size > MAX_WINDOW_SIZE {
        errors.push(ValidationError::new(
            "http2.initial_window_size",
            format!("must not exceed {MAX_WINDOW_SIZE}"),
        ));
    }
    if http2.max_concurrent_streams == 0 {
        errors.push(ValidationError::new("http2.max_concurrent_streams", "must be at least 1"));
    }

    let observability = &config.observability;
    if observability.metrics_enabled && observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            "must be a socket address such as 127.0.0.1:9090",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate_config(&ServerConfig::default()).is_ok());
    }

    #[test]
    fn test_pool_must_cover_connection_limit() {
        let mut config = ServerConfig::default();
        config.listener.max_connections = 500;
        config.buffers.pool_capacity = 499;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "buffers.pool_capacity");

        config.buffers.pool_capacity = 500;
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_reports_every_error() {
        let mut config = ServerConfig::default();
        config.listener.workers = 0;
        config.http1.max_pipeline_depth = 0;
        config.http2.initial_window_size = u32::MAX;

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec![
                "listener.workers",
                "http1.max_pipeline_depth",
                "http2.initial_window_size"
            ]
        );
    }

    #[test]
    fn test_bad_cidr() {
        let mut config = ServerConfig::default();
        config.ip_filter.deny = vec!["10.0.0.0/33".to_string(), "not-an-ip".to_string()];
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.field == "ip_filter.deny"));
    }

    #[test]
    fn test_rate_limit_checked_only_when_enabled() {
        let mut config = ServerConfig::default();
        config.rate_limit.rate = 0.0;
        assert!(validate_config(&config).is_ok());

        config.rate_limit.enabled = true;
        assert!(validate_config(&config).is_err());
    }
}
