//! Protocol selection for a fresh connection.
//!
//! TLS connections use the ALPN result. Plaintext connections are HTTP/2
//! with prior knowledge when they open with the client preface, HTTP/1.1
//! otherwise; an h2c upgrade is picked up later by the HTTP/1.1 handler.

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncRead;

use crate::app::Protocol;
use crate::buffer::BufferPool;
use crate::error::EngineError;
use crate::http2::frame::PREFACE;
use crate::net::io::read_pooled;
use crate::net::tls::ALPN_H2;

/// Protocol chosen for a connection, with the bytes already read from it.
#[derive(Debug)]
pub enum Negotiated {
    Http1(BytesMut),
    Http2(BytesMut),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Detected {
    Http1,
    Http2,
}

/// Map the ALPN protocol agreed during the TLS handshake. No ALPN means
/// HTTP/1.1.
pub fn negotiate_alpn(alpn: Option<&[u8]>) -> Protocol {
    match alpn {
        Some(proto) if proto == ALPN_H2 => Protocol::Http2,
        _ => Protocol::Http11,
    }
}

/// Decide from the first bytes of a plaintext connection. `None` while the
/// bytes are still a prefix of the HTTP/2 preface.
fn classify(buf: &[u8], h2_enabled: bool) -> Option<Detected> {
    if !h2_enabled {
        return Some(Detected::Http1);
    }
    let n = buf.len().min(PREFACE.len());
    if buf[..n] != PREFACE[..n] {
        return Some(Detected::Http1);
    }
    (buf.len() >= PREFACE.len()).then_some(Detected::Http2)
}

/// Read just enough of a plaintext connection to pick a protocol.
///
/// Returns `None` when the peer closes or stays silent past `read_timeout`
/// without sending anything. With HTTP/2 disabled nothing is read.
pub async fn negotiate_plaintext<R>(
    io: &mut R,
    pool: &BufferPool,
    h2_enabled: bool,
    read_timeout: Duration,
) -> Result<Option<Negotiated>, EngineError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::new();
    let detected = match tokio::time::timeout(read_timeout, detect(io, pool, &mut buf, h2_enabled)).await {
        Ok(result) => result?,
        Err(_) => None,
    };
    Ok(match detected {
        Some(Detected::Http2) => Some(Negotiated::Http2(buf)),
        Some(Detected::Http1) => Some(Negotiated::Http1(buf)),
        // A partial head is left for the HTTP/1.1 handler to time out or reject.
        None if !buf.is_empty() => Some(Negotiated::Http1(buf)),
        None => None,
    })
}

async fn detect<R>(io: &mut R, pool: &BufferPool, buf: &mut BytesMut, h2_enabled: bool) -> Result<Option<Detected>, EngineError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(detected) = classify(&buf[..], h2_enabled) {
            return Ok(Some(detected));
        }
        if read_pooled(io, pool, buf).await? == 0 {
            return Ok(None);
        }
    }
}
