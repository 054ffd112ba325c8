//! HTTP/1.1 and HTTP/2 server engine.
//!
//! # Architecture Overview
//!
//! ```text
//!   Supervisor ──spawn──▶ worker 0..N (one current_thread runtime each)
//!                            │
//!                            ▼
//!   net::listener ─▶ net::acceptor ─▶ admission (IP filter, rate limit)
//!                            │
//!                            ▼
//!                   net::negotiate (ALPN, preface, h2c upgrade)
//!                      │                     │
//!                      ▼                     ▼
//!                  http1::handler       http2::handler
//!                      │                     │
//!                      └───────┬─────────────┘
//!                              ▼
//!            server::EngineContext (CORS, per-request tokens)
//!                              │
//!                              ▼
//!                  app::AppBridge ─▶ Application
//! ```
//!
//! All socket I/O goes through the worker's `buffer::BufferPool`.

pub mod app;
pub mod buffer;
pub mod config;
pub mod error;
pub mod http1;
pub mod http2;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod security;
pub mod server;

pub use app::{AppError, Application, Echo, Request, Response};
pub use config::ServerConfig;
pub use error::{EngineError, ErrorKind};
pub use lifecycle::{Shutdown, ShutdownSignal, Supervisor};
pub use server::{EngineContext, Server};
