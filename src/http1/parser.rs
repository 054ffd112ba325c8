//! Incremental HTTP/1.x request decoder.
//!
//! The decoder is fed the connection's read buffer and consumes one request
//! at a time, leaving pipelined bytes in place for the next call.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::app::{split_target, Body, Headers, Protocol};
use crate::security::{LimitViolation, RequestLimits};

/// Longest chunk-size or trailer line accepted.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed request: {0}")]
    Malformed(&'static str),

    #[error("{0}")]
    Limit(#[from] LimitViolation),
}

impl ParseError {
    /// Status sent before the connection is closed.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::Malformed(_) => 400,
            ParseError::Limit(v) => v.status(),
        }
    }
}

/// A request whose head and body have been fully received.
#[derive(Debug)]
pub struct ParsedRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub version: Protocol,
    pub headers: Headers,
    pub body: Body,
    /// Connection may carry another request after this one.
    pub keep_alive: bool,
}

impl ParsedRequest {
    pub fn is_head(&self) -> bool {
        self.method == "HEAD"
    }
}

#[derive(Debug)]
pub enum DecodeEvent {
    /// Head carried `Expect: 100-continue`; the body has not arrived yet.
    ExpectContinue,
    Request(ParsedRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Length(u64),
    Chunked(ChunkState),
}

#[derive(Debug)]
enum State {
    Head,
    Body {
        request: ParsedRequest,
        kind: BodyKind,
        received: u64,
    },
}

/// Per-connection request decoder.
#[derive(Debug)]
pub struct RequestDecoder {
    limits: RequestLimits,
    state: State,
}

impl RequestDecoder {
    pub fn new(limits: RequestLimits) -> Self {
        Self {
            limits,
            state: State::Head,
        }
    }

    /// True when part of a request has been received but not all of it.
    pub fn in_progress(&self, buf: &BytesMut) -> bool {
        matches!(self.state, State::Body { .. }) || !buf.is_empty()
    }

    /// Consume the next request from `buf`, if it is complete.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<DecodeEvent>, ParseError> {
        if let State::Head = self.state {
            let Some((request, kind, expect)) = self.decode_head(buf)? else {
                return Ok(None);
            };
            match kind {
                None => return Ok(Some(DecodeEvent::Request(request))),
                Some(kind) => {
                    self.state = State::Body {
                        request,
                        kind,
                        received: 0,
                    };
                    if expect {
                        return Ok(Some(DecodeEvent::ExpectContinue));
                    }
                }
            }
        }

        if self.decode_body(buf)? {
            match std::mem::replace(&mut self.state, State::Head) {
                State::Body { request, .. } => Ok(Some(DecodeEvent::Request(request))),
                State::Head => Ok(None),
            }
        } else {
            Ok(None)
        }
    }

    fn decode_head(
        &self,
        buf: &mut BytesMut,
    ) -> Result<Option<(ParsedRequest, Option<BodyKind>, bool)>, ParseError> {
        // Tolerate stray CRLFs between pipelined requests.
        while buf.starts_with(b"\r\n") {
            buf.advance(2);
        }
        if buf.is_empty() {
            return Ok(None);
        }

        let mut header_slots = vec![httparse::EMPTY_HEADER; self.limits.max_headers()];
        let mut req = httparse::Request::new(&mut header_slots);
        let head_len = match req.parse(&buf[..]) {
            Ok(httparse::Status::Complete(n)) => n,
            Ok(httparse::Status::Partial) => {
                if buf.len() > self.limits.max_head_size() {
                    return Err(LimitViolation::HeadTooLarge.into());
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(LimitViolation::TooManyHeaders.into());
            }
            Err(httparse::Error::Version) => return Err(ParseError::Malformed("unsupported version")),
            Err(_) => return Err(ParseError::Malformed("invalid request head")),
        };
        if head_len > self.limits.max_head_size() {
            return Err(LimitViolation::HeadTooLarge.into());
        }

        let method = req.method.ok_or(ParseError::Malformed("missing method"))?;
        let target = req.path.ok_or(ParseError::Malformed("missing target"))?;
        let version = match req.version {
            Some(0) => Protocol::Http10,
            Some(1) => Protocol::Http11,
            _ => return Err(ParseError::Malformed("unsupported version")),
        };

        self.limits.check_method(method)?;
        let (path, query) = split_target(target);
        self.limits.check_target(method, &path, query.as_deref())?;
        self.limits.check_header_count(req.headers.len())?;

        let mut headers = Headers::with_capacity(req.headers.len());
        for header in req.headers.iter() {
            self.limits.check_header(header.name.as_bytes(), header.value)?;
            let value = std::str::from_utf8(header.value)
                .map_err(|_| ParseError::Malformed("header value is not valid UTF-8"))?;
            headers.append(header.name, value.trim());
        }
        let method = method.to_string();
        buf.advance(head_len);

        let kind = body_kind(&headers)?;
        if let Some(BodyKind::Length(len)) = kind {
            self.limits.check_body_len(len)?;
        }

        let keep_alive = match version {
            Protocol::Http10 => headers.has_token("connection", "keep-alive"),
            _ => !headers.has_token("connection", "close"),
        };
        let expect = kind.is_some()
            && version == Protocol::Http11
            && headers
                .get("expect")
                .is_some_and(|v| v.eq_ignore_ascii_case("100-continue"));

        let request = ParsedRequest {
            method,
            path,
            query,
            version,
            headers,
            body: Body::empty(),
            keep_alive,
        };
        Ok(Some((request, kind, expect)))
    }

    /// Returns true once the body is complete.
    fn decode_body(&mut self, buf: &mut BytesMut) -> Result<bool, ParseError> {
        let max_body = self.limits.max_body_size() as u64;
        let State::Body {
            request,
            kind,
            received,
        } = &mut self.state
        else {
            return Ok(false);
        };

        loop {
            match kind {
                BodyKind::Length(remaining) => {
                    let n = (*remaining).min(buf.len() as u64) as usize;
                    if n > 0 {
                        request.body.push(buf.split_to(n).freeze());
                        *remaining -= n as u64;
                        *received += n as u64;
                    }
                    return Ok(*remaining == 0);
                }
                BodyKind::Chunked(ChunkState::Size) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    let size = parse_chunk_size(&line)?;
                    if size == 0 {
                        *kind = BodyKind::Chunked(ChunkState::Trailers);
                    } else {
                        if received.saturating_add(size) > max_body {
                            return Err(LimitViolation::BodyTooLarge.into());
                        }
                        *kind = BodyKind::Chunked(ChunkState::Data(size));
                    }
                }
                BodyKind::Chunked(ChunkState::Data(remaining)) => {
                    let n = (*remaining).min(buf.len() as u64) as usize;
                    if n == 0 {
                        return Ok(false);
                    }
                    request.body.push(buf.split_to(n).freeze());
                    *received += n as u64;
                    *remaining -= n as u64;
                    if *remaining == 0 {
                        *kind = BodyKind::Chunked(ChunkState::DataEnd);
                    }
                }
                BodyKind::Chunked(ChunkState::DataEnd) => {
                    if buf.len() < 2 {
                        return Ok(false);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(ParseError::Malformed("missing CRLF after chunk"));
                    }
                    buf.advance(2);
                    *kind = BodyKind::Chunked(ChunkState::Size);
                }
                BodyKind::Chunked(ChunkState::Trailers) => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(false);
                    };
                    if line.is_empty() {
                        return Ok(true);
                    }
                }
            }
        }
    }
}

/// Determine request body framing from the headers.
fn body_kind(headers: &Headers) -> Result<Option<BodyKind>, ParseError> {
    let has_te = headers.contains("transfer-encoding");
    let has_cl = headers.contains("content-length");
    if has_te && has_cl {
        return Err(ParseError::Malformed("both Content-Length and Transfer-Encoding"));
    }

    if has_te {
        let last = headers
            .get_all("transfer-encoding")
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .last();
        return match last {
            Some(t) if t.eq_ignore_ascii_case("chunked") => {
                Ok(Some(BodyKind::Chunked(ChunkState::Size)))
            }
            _ => Err(ParseError::Malformed("unsupported transfer coding")),
        };
    }

    let mut length: Option<u64> = None;
    for value in headers.get_all("content-length").flat_map(|v| v.split(',')) {
        let value = value.trim();
        if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::Malformed("invalid Content-Length"));
        }
        let parsed: u64 = value
            .parse()
            .map_err(|_| ParseError::Malformed("invalid Content-Length"))?;
        match length {
            Some(existing) if existing != parsed => {
                return Err(ParseError::Malformed("conflicting Content-Length"));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        Some(0) | None => None,
        Some(n) => Some(BodyKind::Length(n)),
    })
}

/// Split off one CRLF-terminated line, without the terminator.
fn take_line(buf: &mut BytesMut) -> Result<Option<BytesMut>, ParseError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(pos) => {
            let line = buf.split_to(pos);
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > MAX_CHUNK_LINE => Err(ParseError::Malformed("chunk line too long")),
        None => Ok(None),
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, ParseError> {
    let digits = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let digits = std::str::from_utf8(digits)
        .map_err(|_| ParseError::Malformed("invalid chunk size"))?
        .trim();
    if digits.is_empty() || digits.len() > 15 {
        return Err(ParseError::Malformed("invalid chunk size"));
    }
    u64::from_str_radix(digits, 16).map_err(|_| ParseError::Malformed("invalid chunk size"))
}
