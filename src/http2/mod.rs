//! HTTP/2 subsystem.
//!
//! # Data Flow
//! ```text
//! socket bytes
//!     → frame.rs (9-byte header, payload validation)
//!     → connection.rs (stream states, SETTINGS, flow control, HPACK)
//!     → H2Event::Request
//!     → handler.rs (dispatch on a task per stream)
//!     → connection.rs send_response / flush_data
//!     → socket
//! ```
//!
//! # Design Decisions
//! - The protocol core is sans-IO; only `handler.rs` touches the socket
//! - Connection errors end in GOAWAY, stream errors in RST_STREAM
//! - Response DATA is scheduled by weight, then by stream id

pub mod connection;
pub mod error;
pub mod flow;
pub mod frame;
pub mod handler;
pub mod hpack;
mod huffman;
pub mod settings;
pub mod stream;

pub use connection::{H2Connection, H2Event, PushRequest};
pub use error::{ErrorCode, H2Error};
pub use handler::{is_h2c_upgrade, serve, H2cUpgrade};
pub use settings::Settings;
