//! Request shape and size limits.
//!
//! # Responsibilities
//! - Enforce maximum request body size
//! - Enforce maximum header size and count
//! - Reject unknown methods, path traversal and oversized path segments
//!
//! # Design Decisions
//! - Limits checked before the body is read (early rejection)
//! - Return 413 Payload Too Large or 431 Request Header Fields Too Large;
//!   every other violation is a plain 400

use thiserror::Error;

use crate::config::LimitsConfig;

pub const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "DELETE", "OPTIONS", "HEAD", "PATCH"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LimitViolation {
    #[error("request head too large")]
    HeadTooLarge,

    #[error("too many header fields")]
    TooManyHeaders,

    #[error("header name too long")]
    HeaderNameTooLong,

    #[error("header value too long")]
    HeaderValueTooLong,

    #[error("invalid header value")]
    InvalidHeaderValue,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("invalid request target")]
    InvalidTarget,

    #[error("path traversal not allowed")]
    PathTraversal,

    #[error("path segment too long")]
    SegmentTooLong,

    #[error("query string too long")]
    QueryTooLong,
}

impl LimitViolation {
    pub fn status(&self) -> u16 {
        match self {
            LimitViolation::HeadTooLarge
            | LimitViolation::TooManyHeaders
            | LimitViolation::HeaderNameTooLong
            | LimitViolation::HeaderValueTooLong => 431,
            LimitViolation::BodyTooLarge => 413,
            _ => 400,
        }
    }
}

/// Limits shared by the HTTP/1.1 and HTTP/2 handlers.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    config: LimitsConfig,
}

impl RequestLimits {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    pub fn max_head_size(&self) -> usize {
        self.config.max_head_size
    }

    pub fn max_headers(&self) -> usize {
        self.config.max_headers
    }

    pub fn max_body_size(&self) -> usize {
        self.config.max_body_size
    }

    pub fn check_method(&self, method: &str) -> Result<(), LimitViolation> {
        if ALLOWED_METHODS.iter().any(|m| *m == method) {
            Ok(())
        } else {
            Err(LimitViolation::MethodNotAllowed)
        }
    }

    /// Validate path and query of an origin-form target.
    pub fn check_target(&self, method: &str, path: &str, query: Option<&str>) -> Result<(), LimitViolation> {
        if path == "*" {
            return if method == "OPTIONS" && query.is_none() {
                Ok(())
            } else {
                Err(LimitViolation::InvalidTarget)
            };
        }
        if !path.starts_with('/') {
            return Err(LimitViolation::InvalidTarget);
        }

        let lower = path.to_ascii_lowercase();
        if lower.contains("..") || lower.contains("%2e%2e") || lower.contains("%252e%252e") {
            return Err(LimitViolation::PathTraversal);
        }
        for segment in lower.split('/') {
            if segment.contains('\0') || segment.contains("%00") {
                return Err(LimitViolation::InvalidTarget);
            }
            if segment.len() > self.config.max_segment_len {
                return Err(LimitViolation::SegmentTooLong);
            }
        }

        if let Some(query) = query {
            if query.len() > self.config.max_query_len {
                return Err(LimitViolation::QueryTooLong);
            }
            if query.contains('\0') {
                return Err(LimitViolation::InvalidTarget);
            }
        }
        Ok(())
    }

    pub fn check_header_count(&self, count: usize) -> Result<(), LimitViolation> {
        if count > self.config.max_headers {
            Err(LimitViolation::TooManyHeaders)
        } else {
            Ok(())
        }
    }

    pub fn check_header(&self, name: &[u8], value: &[u8]) -> Result<(), LimitViolation> {
        if name.len() > self.config.max_header_name {
            return Err(LimitViolation::HeaderNameTooLong);
        }
        if value.len() > self.config.max_header_value {
            return Err(LimitViolation::HeaderValueTooLong);
        }
        if value.iter().any(|&b| b == b'\r' || b == b'\n' || b == 0) {
            return Err(LimitViolation::InvalidHeaderValue);
        }
        Ok(())
    }

    pub fn check_body_len(&self, len: u64) -> Result<(), LimitViolation> {
        if len > self.config.max_body_size as u64 {
            Err(LimitViolation::BodyTooLarge)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> RequestLimits {
        RequestLimits::new(&LimitsConfig::default())
    }

    #[test]
    fn test_methods() {
        let limits = limits();
        for method in ALLOWED_METHODS {
            assert!(limits.check_method(method).is_ok());
        }
        assert_eq!(limits.check_method("TRACE"), Err(LimitViolation::MethodNotAllowed));
        assert_eq!(limits.check_method("CONNECT"), Err(LimitViolation::MethodNotAllowed));
        assert_eq!(limits.check_method("get"), Err(LimitViolation::MethodNotAllowed));
    }

    #[test]
    fn test_targets() {
        let limits = limits();
        assert!(limits.check_target("GET", "/", None).is_ok());
        assert!(limits.check_target("GET", "/a/b.txt", Some("x=1")).is_ok());
        assert!(limits.check_target("OPTIONS", "*", None).is_ok());
        assert_eq!(limits.check_target("GET", "*", None), Err(LimitViolation::InvalidTarget));
        assert_eq!(limits.check_target("GET", "a/b", None), Err(LimitViolation::InvalidTarget));
    }

    #[test]
    fn test_traversal() {
        let limits = limits();
        for path in ["/../etc/passwd", "/a/%2E%2e/b", "/a/%252e%252e/b"] {
            assert_eq!(
                limits.check_target("GET", path, None),
                Err(LimitViolation::PathTraversal),
                "{path}"
            );
        }
        assert_eq!(
            limits.check_target("GET", "/a%00b", None),
            Err(LimitViolation::InvalidTarget)
        );
    }

    #[test]
    fn test_segment_and_query_length() {
        let limits = limits();
        let ok = format!("/{}", "a".repeat(255));
        let long = format!("/{}", "a".repeat(256));
        assert!(limits.check_target("GET", &ok, None).is_ok());
        assert_eq!(
            limits.check_target("GET", &long, None),
            Err(LimitViolation::SegmentTooLong)
        );

        let query = "q".repeat(2049);
        assert_eq!(
            limits.check_target("GET", "/", Some(&query)),
            Err(LimitViolation::QueryTooLong)
        );
    }

    #[test]
    fn test_headers_and_body() {
        let limits = limits();
        assert!(limits.check_header(b"Host", b"example.com").is_ok());
        assert_eq!(
            limits.check_header(&[b'x'; 257], b"v"),
            Err(LimitViolation::HeaderNameTooLong)
        );
        assert_eq!(
            limits.check_header(b"x", &[b'v'; 8193]),
            Err(LimitViolation::HeaderValueTooLong)
        );
        assert_eq!(
            limits.check_header(b"x", b"a\r\nb"),
            Err(LimitViolation::InvalidHeaderValue)
        );
        assert_eq!(limits.check_header_count(101), Err(LimitViolation::TooManyHeaders));
        assert!(limits.check_body_len(10 * 1024 * 1024).is_ok());
        assert_eq!(
            limits.check_body_len(10 * 1024 * 1024 + 1),
            Err(LimitViolation::BodyTooLarge)
        );
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(LimitViolation::HeadTooLarge.status(), 431);
        assert_eq!(LimitViolation::BodyTooLarge.status(), 413);
        assert_eq!(LimitViolation::PathTraversal.status(), 400);
    }
}
