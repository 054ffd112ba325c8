//! Worker-wide shared state and the public server entry point.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use crate::app::{AppBridge, Application, Request, Response};
use crate::buffer::BufferPool;
use crate::config::{CorsMismatch, ServerConfig};
use crate::error::{EngineError, Rejection};
use crate::lifecycle::ShutdownSignal;
use crate::net::acceptor::ConnectionAcceptor;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::Listener;
use crate::net::tls::{build_tls_acceptor, TlsAcceptor};
use crate::observability::metrics::record_rejection;
use crate::security::{CorsOutcome, CorsValidator, IpFilter, RateLimiter, RequestLimits};

/// Everything a connection task needs, shared by all connections of a worker.
pub struct EngineContext {
    pub config: ServerConfig,
    pub pool: BufferPool,
    pub limits: RequestLimits,
    pub tracker: ConnectionTracker,
    cors: CorsValidator,
    rate_limiter: Option<RateLimiter>,
    ip_filter: IpFilter,
    bridge: AppBridge,
}

impl EngineContext {
    pub fn new(config: ServerConfig, app: Arc<dyn Application>) -> Result<Self, EngineError> {
        let rate_limiter = if config.rate_limit.enabled {
            Some(
                RateLimiter::new(&config.rate_limit)
                    .map_err(|e| EngineError::Config(format!("rate_limit: {e}")))?,
            )
        } else {
            None
        };
        let ip_filter = IpFilter::from_config(&config.ip_filter)
            .map_err(|e| EngineError::Config(format!("ip_filter: {e}")))?;

        Ok(Self {
            pool: BufferPool::new(&config.buffers),
            limits: RequestLimits::new(&config.limits),
            tracker: ConnectionTracker::new(),
            cors: CorsValidator::new(&config.cors),
            rate_limiter,
            ip_filter,
            bridge: AppBridge::new(app),
            config,
        })
    }

    /// Connection admission: IP filter, then the connection's first token.
    pub fn admit_peer(&self, ip: IpAddr) -> Result<(), Rejection> {
        if !self.ip_filter.is_allowed(ip) {
            record_rejection(Rejection::IpDenied);
            tracing::warn!(peer = %ip, "Connection denied by IP filter");
            return Err(Rejection::IpDenied);
        }
        self.charge(ip)
    }

    /// Take one rate-limit token for `ip`.
    pub fn charge(&self, ip: IpAddr) -> Result<(), Rejection> {
        match &self.rate_limiter {
            Some(limiter) if !limiter.check(&ip) => {
                record_rejection(Rejection::RateLimited);
                tracing::warn!(peer = %ip, "Rate limit exceeded");
                Err(Rejection::RateLimited)
            }
            _ => Ok(()),
        }
    }

    /// Run admission checks for a parsed request and dispatch it.
    ///
    /// `charge` is false for the first request of a connection, whose token
    /// was taken when the connection was admitted.
    pub async fn handle(&self, request: Request, charge: bool) -> Response {
        if charge {
            if let Err(rejection) = self.charge(request.context.peer_addr.ip()) {
                return Response::status_only(rejection.status());
            }
        }

        match self.cors.evaluate(&request.method, &request.headers) {
            CorsOutcome::NotApplicable => self.bridge.dispatch(request).await,
            CorsOutcome::Preflight(headers) => {
                let mut response = Response::new(204);
                response.headers.extend(headers.iter());
                response
            }
            CorsOutcome::Allowed(headers) => {
                let mut response = self.bridge.dispatch(request).await;
                response.headers.extend(headers.iter());
                response
            }
            CorsOutcome::Mismatch { preflight } => match self.cors.on_mismatch() {
                CorsMismatch::Reject => {
                    record_rejection(Rejection::CorsMismatch);
                    tracing::warn!(
                        peer = %request.context.peer_addr,
                        origin = request.headers.get("origin").unwrap_or_default(),
                        "CORS origin rejected"
                    );
                    Response::status_only(Rejection::CorsMismatch.status())
                }
                CorsMismatch::Omit if preflight => Response::new(204),
                CorsMismatch::Omit => self.bridge.dispatch(request).await,
            },
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.config.shutdown.grace_period_secs)
    }
}

/// A bound listener plus the state its connections share.
pub struct Server {
    listener: Listener,
    ctx: Arc<EngineContext>,
    tls: Option<TlsAcceptor>,
}

impl Server {
    /// Validate TLS material, bind the listening socket and build shared state.
    pub async fn bind(config: ServerConfig, app: Arc<dyn Application>) -> Result<Self, EngineError> {
        let tls = match &config.tls {
            Some(tls) => Some(
                build_tls_acceptor(tls, config.http2.enabled)
                    .map_err(|e| EngineError::Config(format!("tls: {e}")))?,
            ),
            None => None,
        };
        let listener = Listener::bind(&config.listener)
            .map_err(|e| EngineError::Transport(e.into_io()))?;
        let ctx = Arc::new(EngineContext::new(config, app)?);
        Ok(Self { listener, ctx, tls })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn context(&self) -> Arc<EngineContext> {
        Arc::clone(&self.ctx)
    }

    /// Accept connections until `shutdown` fires, then drain.
    pub async fn run(self, shutdown: ShutdownSignal) -> Result<(), EngineError> {
        ConnectionAcceptor::new(self.listener, self.ctx, self.tls)
            .run(shutdown)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, Body, Headers, Protocol, RequestContext, Scheme};
    use crate::config::CorsConfig;
    use crate::error::ErrorKind;

    fn ok_app() -> Arc<dyn Application> {
        Arc::new(|_req: Request| -> Result<Response, AppError> { Ok(Response::text(200, "ok")) })
    }

    fn request(method: &str, headers: &[(&str, &str)]) -> Request {
        Request {
            method: method.to_string(),
            path: "/".to_string(),
            query: None,
            version: Protocol::Http11,
            headers: headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect::<Headers>(),
            body: Body::empty(),
            context: RequestContext::new(
                "10.0.0.1:5000".parse().unwrap(),
                "127.0.0.1:80".parse().unwrap(),
                Scheme::Http,
                Protocol::Http11,
            ),
        }
    }

    #[tokio::test]
    async fn test_rate_limited_requests_get_429() {
        let mut config = ServerConfig::default();
        config.rate_limit.enabled = true;
        config.rate_limit.rate = 1.0;
        config.rate_limit.burst = 1.0;
        let ctx = EngineContext::new(config, ok_app()).unwrap();

        assert_eq!(ctx.handle(request("GET", &[]), true).await.status, 200);
        assert_eq!(ctx.handle(request("GET", &[]), true).await.status, 429);
        // Uncharged requests are not limited here.
        assert_eq!(ctx.handle(request("GET", &[]), false).await.status, 200);
    }

    #[tokio::test]
    async fn test_peer_admission() {
        let mut config = ServerConfig::default();
        config.ip_filter.deny = vec!["10.0.0.0/8".to_string()];
        let ctx = EngineContext::new(config, ok_app()).unwrap();
        assert_eq!(ctx.admit_peer("10.1.1.1".parse().unwrap()), Err(Rejection::IpDenied));
        assert_eq!(ctx.admit_peer("11.1.1.1".parse().unwrap()), Ok(()));
    }

    #[test]
    fn test_bad_filter_entry_is_a_config_error() {
        let mut config = ServerConfig::default();
        config.ip_filter.allow = vec!["10.0.0.0/40".to_string()];
        let err = EngineContext::new(config, ok_app()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(err.to_string().starts_with("configuration error: ip_filter"), "{err}");
    }

    #[tokio::test]
    async fn test_cors_preflight_and_reject() {
        let mut config = ServerConfig::default();
        config.cors = CorsConfig {
            enabled: true,
            allowed_origins: vec!["https://ok.test".to_string()],
            on_mismatch: CorsMismatch::Reject,
            ..CorsConfig::default()
        };
        let ctx = EngineContext::new(config, ok_app()).unwrap();

        let preflight = ctx
            .handle(
                request(
                    "OPTIONS",
                    &[("Origin", "https://ok.test"), ("Access-Control-Request-Method", "POST")],
                ),
                false,
            )
            .await;
        assert_eq!(preflight.status, 204);
        assert_eq!(
            preflight.headers.get("access-control-allow-origin"),
            Some("https://ok.test")
        );

        let simple = ctx
            .handle(request("GET", &[("Origin", "https://ok.test")]), false)
            .await;
        assert_eq!(simple.status, 200);
        assert_eq!(simple.headers.get("vary"), Some("Origin"));

        let rejected = ctx
            .handle(request("GET", &[("Origin", "https://bad.test")]), false)
            .await;
        assert_eq!(rejected.status, 403);
    }
}
