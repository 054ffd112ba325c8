//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ServerConfig (validated, immutable)
//!     → CLI overrides applied by the supervisor, re-validated
//!     → shared via Arc with every subsystem of a worker
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; workers read it once at startup
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load_config, ConfigError};
pub use schema::{
    BufferConfig, CorsConfig, CorsMismatch, Http1Config, Http2Config, IpFilterConfig,
    LimitsConfig, ListenerConfig, LogFormat, MatchPolicy, ObservabilityConfig, RateLimitConfig,
    ServerConfig, ShutdownConfig, TlsConfig,
};
pub use validation::{validate_config, ValidationError};
