//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept, connection limit permit)
//!     → acceptor.rs (IP filter + rate limit, before any protocol work)
//!     → tls.rs (optional handshake, ALPN h2 / http/1.1)
//!     → negotiate.rs (ALPN result or plaintext preface sniffing)
//!     → HTTP/1.1 or HTTP/2 handler
//!
//! Connection States:
//!     Accepting → Active → Draining → Closed
//! ```
//!
//! # Design Decisions
//! - The connection limit is a semaphore permit held for the connection lifetime
//! - Every connection is tracked so shutdown can wait for them to drain
//! - Reads and writes go through pooled buffers (io.rs)

pub mod acceptor;
pub mod connection;
pub mod io;
pub mod listener;
pub mod negotiate;
pub mod tls;

pub use acceptor::ConnectionAcceptor;
pub use connection::{Connection, ConnectionState, ConnectionTracker};
pub use negotiate::{negotiate_alpn, Negotiated};
