//! HTTP/1.1 subsystem.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → parser.rs (httparse head, Content-Length / chunked body, limits)
//!     → handler.rs (dispatch up to max_pipeline_depth requests at once)
//!     → pipeline.rs (hold responses until earlier ones are written)
//!     → handler.rs (framing: Content-Length, chunked or close-delimited)
//!     → socket
//! ```
//!
//! # Design Decisions
//! - A parse error answers with 400/413/431 and closes, after earlier
//!   responses have been flushed
//! - An h2c upgrade is only honoured on the first request of a connection

pub mod handler;
pub mod parser;
pub mod pipeline;

pub use handler::{serve, Http1Outcome};
pub use parser::{DecodeEvent, ParseError, ParsedRequest, RequestDecoder};
pub use pipeline::PipelineQueue;
