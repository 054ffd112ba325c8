//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Worker startup:
//!     → logging.rs (tracing subscriber: EnvFilter + fmt, pretty or json)
//!     → metrics.rs (optional Prometheus exporter, port offset per worker)
//!
//! Per request:
//!     handler completes → log_access (target "access") + record_request
//! ```
//!
//! # Design Decisions
//! - `tracing` for structured logs, `metrics` facade for counters
//! - Recording is a no-op until a recorder is installed, so tests need no setup

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, log_access, AccessRecord};
