//! Response produced by the application.

use bytes::Bytes;

use super::headers::Headers;

/// Value of the `Server` header added when the application sets none.
pub const SERVER_NAME: &str = "http-engine";

/// Lazy, finite, single-pass sequence of body chunks.
pub type BodyStream = Box<dyn Iterator<Item = Bytes> + Send>;

pub struct Response {
    pub status: u16,
    pub headers: Headers,
    body: BodyStream,
    length: Option<u64>,
    /// Paths to push alongside this response when the peer accepts push.
    pub push: Vec<String>,
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("length", &self.length)
            .field("push", &self.push)
            .finish_non_exhaustive()
    }
}

impl Response {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Box::new(std::iter::empty()),
            length: Some(0),
            push: Vec::new(),
        }
    }

    /// Plain-text response with a known length.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header("content-type", "text/plain; charset=utf-8")
            .with_body(Bytes::from(body.into()))
    }

    /// Status response whose body is the reason phrase.
    pub fn status_only(status: u16) -> Self {
        Self::text(status, reason_phrase(status))
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        self.length = Some(body.len() as u64);
        self.body = Box::new(std::iter::once(body));
        self
    }

    /// Body of unknown length, pulled lazily while writing.
    pub fn with_stream<I>(mut self, chunks: I) -> Self
    where
        I: Iterator<Item = Bytes> + Send + 'static,
    {
        self.length = None;
        self.body = Box::new(chunks);
        self
    }

    pub fn with_push(mut self, path: impl Into<String>) -> Self {
        self.push.push(path.into());
        self
    }

    /// Body length if known up front.
    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn into_body(self) -> BodyStream {
        self.body
    }

    pub fn into_parts(self) -> (u16, Headers, BodyStream, Option<u64>, Vec<String>) {
        (self.status, self.headers, self.body, self.length, self.push)
    }
}

/// True for statuses that never carry a body.
pub fn is_bodiless(status: u16) -> bool {
    (100..200).contains(&status) || status == 204 || status == 304
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}
