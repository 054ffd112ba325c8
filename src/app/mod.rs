//! Application bridge subsystem.
//!
//! # Data Flow
//! ```text
//! Http1Handler / Http2Handler
//!     → Request (method, path, query, ordered headers, single-pass body)
//!     → bridge.rs (blocking pool, panic containment)
//!     → Application::call
//!     → Response (status, ordered headers, lazy body chunks)
//!     → back to the protocol handler for framing
//! ```
//!
//! # Design Decisions
//! - One trait with one method; closures implement it directly
//! - Failures surface as a bare 500, the detail goes to the log
//! - Headers are an ordered list, not a map

pub mod bridge;
pub mod echo;
pub mod headers;
pub mod request;
pub mod response;

pub use bridge::{pull_chunk, AppBridge, AppError, Application};
pub use echo::Echo;
pub use headers::Headers;
pub use request::{split_target, Body, Protocol, Request, RequestContext, Scheme};
pub use response::{is_bodiless, reason_phrase, BodyStream, Response, SERVER_NAME};
