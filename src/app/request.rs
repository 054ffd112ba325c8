//! Parsed request handed to the application.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use super::headers::Headers;

/// Wire protocol a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http10,
    Http11,
    Http2,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
            Protocol::Http2 => "HTTP/2",
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

/// Connection-level facts about a request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: Uuid,
    pub peer_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub scheme: Scheme,
    pub protocol: Protocol,
}

impl RequestContext {
    /// Context with a fresh request id.
    pub fn new(peer_addr: SocketAddr, local_addr: SocketAddr, scheme: Scheme, protocol: Protocol) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            peer_addr,
            local_addr,
            scheme,
            protocol,
        }
    }
}

/// Single-pass request body. Chunks are yielded in arrival order.
#[derive(Debug, Default)]
pub struct Body {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl Body {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: Bytes) {
        if !chunk.is_empty() {
            self.len += chunk.len();
            self.chunks.push_back(chunk);
        }
    }

    /// Remaining bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Drains the remaining chunks into one buffer.
    pub fn into_bytes(self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks.into_iter().next().unwrap_or_default();
        }
        let mut out = BytesMut::with_capacity(self.len);
        for chunk in self.chunks {
            out.extend_from_slice(&chunk);
        }
        out.freeze()
    }
}

impl From<Bytes> for Body {
    fn from(chunk: Bytes) -> Self {
        let mut body = Body::empty();
        body.push(chunk);
        body
    }
}

impl Iterator for Body {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        let chunk = self.chunks.pop_front()?;
        self.len -= chunk.len();
        Some(chunk)
    }
}

#[derive(Debug)]
pub struct Request {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: Protocol,
    pub headers: Headers,
    pub body: Body,
    pub context: RequestContext,
}

impl Request {
    /// Path plus query, as it appeared in the request target.
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }
}

/// Splits a request target into path and optional query.
pub fn split_target(target: &str) -> (String, Option<String>) {
    match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_is_single_pass() {
        let mut body = Body::empty();
        body.push(Bytes::from_static(b"ab"));
        body.push(Bytes::new());
        body.push(Bytes::from_static(b"cd"));
        assert_eq!(body.len(), 4);
        assert_eq!(body.next().unwrap(), Bytes::from_static(b"ab"));
        assert_eq!(body.len(), 2);
        assert_eq!(body.into_bytes(), Bytes::from_static(b"cd"));
    }

    #[test]
    fn target_splitting() {
        assert_eq!(split_target("/a/b?x=1&y"), ("/a/b".into(), Some("x=1&y".into())));
        assert_eq!(split_target("/"), ("/".into(), None));
    }
}
