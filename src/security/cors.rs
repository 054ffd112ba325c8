//! CORS origin validation and response headers.

use crate::app::Headers;
use crate::config::{CorsConfig, CorsMismatch};

/// Result of checking a request against the CORS policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorsOutcome {
    /// CORS disabled or no `Origin` header.
    NotApplicable,
    /// Valid preflight; answer 204 with these headers.
    Preflight(Headers),
    /// Allowed cross-origin request; add these headers to the response.
    Allowed(Headers),
    /// Origin, method or headers not allowed.
    Mismatch { preflight: bool },
}

#[derive(Debug, Clone)]
pub struct CorsValidator {
    enabled: bool,
    origins: Vec<String>,
    methods: Vec<String>,
    headers: Vec<String>,
    allow_credentials: bool,
    max_age_secs: u64,
    on_mismatch: CorsMismatch,
}

impl CorsValidator {
    pub fn new(config: &CorsConfig) -> Self {
        Self {
            enabled: config.enabled,
            origins: config
                .allowed_origins
                .iter()
                .map(|o| o.trim().to_ascii_lowercase())
                .collect(),
            methods: config.allowed_methods.clone(),
            headers: config.allowed_headers.clone(),
            allow_credentials: config.allow_credentials,
            max_age_secs: config.max_age_secs,
            on_mismatch: config.on_mismatch,
        }
    }

    pub fn on_mismatch(&self) -> CorsMismatch {
        self.on_mismatch
    }

    pub fn evaluate(&self, method: &str, request_headers: &Headers) -> CorsOutcome {
        if !self.enabled {
            return CorsOutcome::NotApplicable;
        }
        let Some(origin) = request_headers.get("origin") else {
            return CorsOutcome::NotApplicable;
        };

        let requested_method = request_headers.get("access-control-request-method");
        let preflight = method.eq_ignore_ascii_case("OPTIONS") && requested_method.is_some();

        let Some(wildcard) = self.match_origin(origin) else {
            return CorsOutcome::Mismatch { preflight };
        };

        let mut out = Headers::new();
        if wildcard && !self.allow_credentials {
            out.append("Access-Control-Allow-Origin", "*");
        } else {
            out.append("Access-Control-Allow-Origin", origin);
            out.append("Vary", "Origin");
        }
        if self.allow_credentials {
            out.append("Access-Control-Allow-Credentials", "true");
        }

        if preflight {
            let method_ok = requested_method.is_some_and(|m| self.method_allowed(m.trim()));
            let headers_ok = request_headers
                .get_all("access-control-request-headers")
                .flat_map(|v| v.split(','))
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .all(|h| self.headers.iter().any(|a| a.eq_ignore_ascii_case(h)));
            if !method_ok || !headers_ok {
                return CorsOutcome::Mismatch { preflight: true };
            }

            out.append("Access-Control-Allow-Methods", self.methods.join(", "));
            if !self.headers.is_empty() {
                out.append("Access-Control-Allow-Headers", self.headers.join(", "));
            }
            out.append("Access-Control-Max-Age", self.max_age_secs.to_string());
            return CorsOutcome::Preflight(out);
        }

        if !self.method_allowed(method) {
            return CorsOutcome::Mismatch { preflight: false };
        }
        CorsOutcome::Allowed(out)
    }

    fn method_allowed(&self, method: &str) -> bool {
        self.methods.iter().any(|m| m.eq_ignore_ascii_case(method))
    }

    /// Some(true) when allowed by a literal `*`, Some(false) for any other match.
    fn match_origin(&self, origin: &str) -> Option<bool> {
        let origin = origin.trim().to_ascii_lowercase();
        let host = origin
            .split_once("://")
            .map_or(origin.as_str(), |(_, rest)| rest);
        let host = host.rsplit_once(':').map_or(host, |(h, port)| {
            if port.bytes().all(|b| b.is_ascii_digit()) {
                h
            } else {
                host
            }
        });

        let mut matched = None;
        for allowed in &self.origins {
            if allowed == "*" {
                matched = matched.or(Some(true));
            } else if let Some(suffix) = allowed.strip_prefix("*.") {
                if host.len() > suffix.len() + 1
                    && host.ends_with(suffix)
                    && host.as_bytes()[host.len() - suffix.len() - 1] == b'.'
                {
                    return Some(false);
                }
            } else if *allowed == origin {
                return Some(false);
            }
        }
        matched
    }
}
