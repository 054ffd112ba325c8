//! Security subsystem.
//!
//! # Data Flow
//! ```text
//! Accepted socket:
//!     → ip_filter.rs (CIDR allow/deny, before TLS or parsing)
//!     → rate_limit.rs (first request's token)
//! Parsed request:
//!     → limits.rs (method, target, header and body sizes)
//!     → rate_limit.rs (later requests and streams)
//!     → cors.rs (preflight answer, or headers for the response)
//!     → Pass to the application
//! ```
//!
//! # Design Decisions
//! - Defense in depth: multiple layers of protection
//! - Fail closed: reject on any security check failure
//! - Rejection bodies never describe the resource

pub mod cors;
pub mod ip_filter;
pub mod limits;
pub mod rate_limit;

pub use cors::{CorsOutcome, CorsValidator};
pub use ip_filter::{Cidr, CidrParseError, FilterDecision, IpFilter};
pub use limits::{LimitViolation, RequestLimits};
pub use rate_limit::{RateLimitError, RateLimiter};
