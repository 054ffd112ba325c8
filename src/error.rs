//! Engine-wide error taxonomy.
//!
//! Subsystems keep their own error enums; `EngineError` folds them into the
//! kinds the connection handlers and startup act on.

use std::io;

use thiserror::Error;

use crate::buffer::PoolError;
use crate::http1::parser::ParseError;
use crate::http2::error::H2Error;

/// Coarse classification used for log fields and metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Application,
    AdmissionRejection,
    ResourceExhaustion,
    Configuration,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Application => "application",
            ErrorKind::AdmissionRejection => "admission_rejection",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::Configuration => "configuration",
        }
    }
}

/// Why admission control turned a peer or request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    RateLimited,
    IpDenied,
    CorsMismatch,
}

impl Rejection {
    /// Status code sent to the client.
    pub fn status(&self) -> u16 {
        match self {
            Rejection::RateLimited => 429,
            Rejection::IpDenied | Rejection::CorsMismatch => 403,
        }
    }

    /// Metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::RateLimited => "rate_limited",
            Rejection::IpDenied => "ip_denied",
            Rejection::CorsMismatch => "cors_mismatch",
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("application error: {0}")]
    Application(String),

    #[error("admission rejected: {}", .0.reason())]
    AdmissionRejection(Rejection),

    #[error("resource exhausted: {0}")]
    ResourceExhaustion(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Transport(_) => ErrorKind::Transport,
            EngineError::Protocol(_) => ErrorKind::Protocol,
            EngineError::Application(_) => ErrorKind::Application,
            EngineError::AdmissionRejection(_) => ErrorKind::AdmissionRejection,
            EngineError::ResourceExhaustion(_) => ErrorKind::ResourceExhaustion,
            EngineError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Connection resets and broken pipes are routine; everything else is worth a warning.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionAborted
            )
        )
    }
}

impl From<PoolError> for EngineError {
    fn from(e: PoolError) -> Self {
        EngineError::ResourceExhaustion(e.to_string())
    }
}

impl From<H2Error> for EngineError {
    fn from(e: H2Error) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

impl From<ParseError> for EngineError {
    fn from(e: ParseError) -> Self {
        EngineError::Protocol(e.to_string())
    }
}

impl From<Rejection> for EngineError {
    fn from(r: Rejection) -> Self {
        EngineError::AdmissionRejection(r)
    }
}
