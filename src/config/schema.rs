//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the server.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};

/// Root configuration for the server.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening socket and worker layout.
    pub listener: ListenerConfig,

    /// Optional TLS termination.
    pub tls: Option<TlsConfig>,

    /// Shared I/O buffer pool.
    pub buffers: BufferConfig,

    /// Per-client token bucket.
    pub rate_limit: RateLimitConfig,

    /// CIDR allow/deny lists.
    pub ip_filter: IpFilterConfig,

    /// Cross-origin request policy.
    pub cors: CorsConfig,

    /// Request size and shape limits.
    pub limits: LimitsConfig,

    /// HTTP/1.1 keep-alive and pipelining.
    pub http1: Http1Config,

    /// HTTP/2 settings advertised to clients.
    pub http2: Http2Config,

    /// Graceful shutdown.
    pub shutdown: ShutdownConfig,

    /// Logging and metrics.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Interface to bind (e.g., "0.0.0.0" or "::").
    pub host: String,

    /// TCP port. Zero picks an ephemeral port.
    pub port: u16,

    /// Number of worker processes.
    pub workers: usize,

    /// Listen backlog.
    pub backlog: u32,

    /// Share the port between workers with SO_REUSEPORT where supported.
    pub reuse_port: bool,

    /// Maximum concurrent connections per worker (backpressure).
    pub max_connections: usize,
}

impl ListenerConfig {
    /// `host:port`, bracketing IPv6 literals.
    pub fn bind_address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            workers: std::thread::available_parallelism().map_or(1, |n| n.get()),
            backlog: 2048,
            reuse_port: true,
            max_connections: 10_000,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Path to certificate chain (PEM).
    pub cert_path: String,

    /// Path to private key (PEM).
    pub key_path: String,

    /// Restrict to these rustls cipher suite names
    /// (e.g. "TLS13_AES_256_GCM_SHA384"). Empty keeps the defaults.
    #[serde(default)]
    pub cipher_suites: Vec<String>,
}

/// Buffer pool sizing.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Size of read buffers in bytes.
    pub buffer_size: usize,

    /// Size of write buffers in bytes.
    pub large_buffer_size: usize,

    /// Maximum buffers allocated per worker. Buffers are allocated on
    /// demand, so this only caps growth.
    pub pool_capacity: usize,

    /// How long `acquire` waits for a free buffer.
    pub acquire_timeout_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            large_buffer_size: 65_536,
            pool_capacity: 10_240,
            acquire_timeout_ms: 1000,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Tokens refilled per second per client IP.
    pub rate: f64,

    /// Bucket capacity.
    pub burst: f64,

    /// Maximum tracked clients before eviction.
    pub max_entries: usize,

    /// Seconds between sweeps of idle buckets.
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: 100.0,
            burst: 50.0,
            max_entries: 10_000,
            cleanup_interval_secs: 3600,
        }
    }
}

/// How allow and deny ranges interact when both match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// Any matching deny range rejects the peer.
    #[default]
    DenyWins,
    /// The longest matching prefix decides; ties go to deny.
    MostSpecific,
}

/// IP filter configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct IpFilterConfig {
    /// Addresses or CIDR ranges allowed. Non-empty means allow-list mode.
    pub allow: Vec<String>,

    /// Addresses or CIDR ranges denied.
    pub deny: Vec<String>,

    /// Conflict resolution between the two lists.
    pub policy: MatchPolicy,
}

/// Behaviour when a request's origin, method or headers are not allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorsMismatch {
    /// Respond normally but without CORS headers.
    #[default]
    Omit,
    /// Respond 403.
    Reject,
}

/// CORS configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorsConfig {
    pub enabled: bool,
    /// Exact origins, "*", or "*.example.com".
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub allow_credentials: bool,
    pub max_age_secs: u64,
    pub on_mismatch: CorsMismatch,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: vec!["*".to_string()],
            allowed_methods: vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()],
            allowed_headers: vec!["Content-Type".to_string()],
            allow_credentials: false,
            max_age_secs: 86_400,
            on_mismatch: CorsMismatch::Omit,
        }
    }
}

/// Request limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Request line plus headers, in bytes.
    pub max_head_size: usize,
    pub max_headers: usize,
    pub max_header_name: usize,
    pub max_header_value: usize,
    /// Request body, in bytes.
    pub max_body_size: usize,
    pub max_segment_len: usize,
    pub max_query_len: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_head_size: 16_384,
            max_headers: 100,
            max_header_name: 256,
            max_header_value: 8192,
            max_body_size: 10 * 1024 * 1024,
            max_segment_len: 255,
            max_query_len: 2048,
        }
    }
}

/// HTTP/1.1 connection handling.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http1Config {
    /// Requests served on one connection before it is closed.
    pub max_requests: usize,

    /// Close a keep-alive connection after this long without a request.
    pub idle_timeout_secs: u64,

    /// Time allowed to finish receiving a started request.
    pub read_timeout_secs: u64,

    /// Requests dispatched ahead of their responses being written.
    pub max_pipeline_depth: usize,
}

impl Default for Http1Config {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            idle_timeout_secs: 60,
            read_timeout_secs: 10,
            max_pipeline_depth: 20,
        }
    }
}

/// HTTP/2 settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Http2Config {
    /// Offer "h2" over ALPN and accept h2c.
    pub enabled: bool,
    pub max_concurrent_streams: u32,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: u32,
    pub header_table_size: u32,
}

impl Default for Http2Config {
    fn default() -> Self {
        Self {
            enabled: true,
            max_concurrent_streams: 100,
            initial_window_size: 65_535,
            max_frame_size: 16_384,
            max_header_list_size: 16_384,
            header_table_size: 4096,
        }
    }
}

/// Shutdown configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time in-flight work gets before connections are force-closed.
    pub grace_period_secs: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 5,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default filter when RUST_LOG is unset.
    pub log_level: String,

    pub log_format: LogFormat,

    /// Expose Prometheus metrics.
    pub metrics_enabled: bool,

    /// Metrics listener; workers add their id to the port.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}
