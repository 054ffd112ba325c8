//! Async driver for one HTTP/2 connection.
//!
//! Owns the socket, feeds bytes into [`H2Connection`], dispatches each
//! completed request to the application on its own task and writes the
//! connection's output back out. Responses are sent as their tasks finish,
//! in whatever order that happens.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::task::{AbortHandle, JoinSet};
use uuid::Uuid;

use super::connection::{H2Connection, H2Event};
use super::settings::Settings;
use super::stream::RequestHead;
use crate::app::{split_target, Body, Headers, Protocol, Request, Response};
use crate::error::EngineError;
use crate::http1::parser::ParsedRequest;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionState};
use crate::net::io::{read_pooled, write_pooled};
use crate::observability::{log_access, AccessRecord};
use crate::server::EngineContext;

const SWITCHING_PROTOCOLS: &[u8] = b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: h2c\r\n\r\n";

/// Headers that do not survive the switch from HTTP/1.1.
const UPGRADE_ONLY: &[&str] = &[
    "connection",
    "upgrade",
    "http2-settings",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
];

/// An HTTP/1.1 request that asked to continue as h2c.
#[derive(Debug)]
pub struct H2cUpgrade {
    settings: Settings,
    head: RequestHead,
    body: Body,
}

impl H2cUpgrade {
    pub fn new(request: ParsedRequest, settings: Settings) -> Self {
        let mut headers = Headers::with_capacity(request.headers.len());
        let mut authority = None;
        for (name, value) in request.headers.iter() {
            let name = name.to_ascii_lowercase();
            if UPGRADE_ONLY.contains(&name.as_str()) {
                continue;
            }
            if name == "host" {
                authority = Some(value.to_string());
            }
            headers.append(name, value);
        }
        let path = match request.query {
            Some(query) => format!("{}?{}", request.path, query),
            None => request.path,
        };
        Self {
            settings,
            head: RequestHead {
                method: request.method,
                scheme: "http".to_string(),
                authority,
                path,
                headers,
            },
            body: request.body,
        }
    }
}

/// `Upgrade: h2c` together with an `HTTP2-Settings` header.
pub fn is_h2c_upgrade(headers: &Headers) -> bool {
    headers.has_token("upgrade", "h2c") && headers.contains("http2-settings")
}

struct Finished {
    stream_id: u32,
    response: Response,
    request_id: Uuid,
    method: String,
    path: String,
    started: Instant,
}

/// In-flight application calls, keyed by stream.
struct Dispatcher {
    tasks: JoinSet<Finished>,
    inflight: HashMap<u32, AbortHandle>,
}

impl Dispatcher {
    fn new() -> Self {
        Self {
            tasks: JoinSet::new(),
            inflight: HashMap::new(),
        }
    }

    fn spawn(&mut self, ctx: &Arc<EngineContext>, conn: &Connection, stream_id: u32, head: RequestHead, body: Body, charge: bool) {
        let (path, query) = split_target(&head.path);
        let request = Request {
            method: head.method,
            path,
            query,
            version: Protocol::Http2,
            headers: head.headers,
            body,
            context: conn.request_context(Protocol::Http2),
        };
        let ctx = Arc::clone(ctx);
        let handle = self.tasks.spawn(async move {
            let started = Instant::now();
            let request_id = request.context.request_id;
            let method = request.method.clone();
            let path = request.path.clone();
            let response = ctx.handle(request, charge).await;
            Finished {
                stream_id,
                response,
                request_id,
                method,
                path,
                started,
            }
        });
        self.inflight.insert(stream_id, handle);
    }

    fn cancel(&mut self, stream_id: u32) {
        if let Some(handle) = self.inflight.remove(&stream_id) {
            handle.abort();
        }
    }

    fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Serve HTTP/2 on `io` until the peer goes away, the connection fails or
/// a drain completes. `buf` holds bytes already read during negotiation.
pub async fn serve<S>(
    io: &mut S,
    mut buf: BytesMut,
    conn: &mut Connection,
    ctx: &Arc<EngineContext>,
    mut shutdown: ShutdownSignal,
    upgrade: Option<H2cUpgrade>,
) -> Result<(), EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = &ctx.config.http2;
    let limits = ctx.limits.clone();
    let mut h2 = match upgrade {
        Some(upgrade) => {
            write_pooled(io, &ctx.pool, SWITCHING_PROTOCOLS).await?;
            tracing::debug!(connection_id = %conn.id(), "Upgraded to h2c");
            H2Connection::upgraded(config, limits, upgrade.settings, upgrade.head, upgrade.body)
        }
        None => H2Connection::new(config, limits),
    };
    conn.set_protocol(Protocol::Http2);
    conn.transition(ConnectionState::Active);

    let idle = Duration::from_secs(ctx.config.http1.idle_timeout_secs);
    let budget = ctx.config.buffers.large_buffer_size;
    let mut dispatcher = Dispatcher::new();
    let mut draining = false;

    loop {
        while let Some(event) = h2.poll_event() {
            match event {
                H2Event::Request { stream_id, head, body } => {
                    // The connection's admission paid for its first request.
                    let charge = conn.record_request() > 1;
                    dispatcher.spawn(ctx, conn, stream_id, head, body, charge);
                }
                H2Event::StreamReset { stream_id } => dispatcher.cancel(stream_id),
            }
        }
        flush(io, &mut h2, ctx, budget).await?;

        if h2.is_closed() {
            return Ok(());
        }
        let settled = !h2.has_open_streams() && dispatcher.is_empty();
        if draining && settled {
            tracing::debug!(connection_id = %conn.id(), "HTTP/2 connection drained");
            return Ok(());
        }
        if h2.peer_going_away() {
            if settled {
                tracing::debug!(connection_id = %conn.id(), "Peer went away, streams finished");
                return Ok(());
            }
            conn.transition(ConnectionState::Draining);
        }

        let quiet = settled;
        tokio::select! {
            read = read_pooled(io, &ctx.pool, &mut buf) => {
                if read? == 0 {
                    tracing::debug!(connection_id = %conn.id(), "Peer closed HTTP/2 connection");
                    return Ok(());
                }
                conn.touch();
                if let Err(e) = h2.recv(&mut buf) {
                    let _ = flush(io, &mut h2, ctx, budget).await;
                    return Err(e.into());
                }
            }
            Some(joined) = dispatcher.tasks.join_next(), if !dispatcher.is_empty() => {
                match joined {
                    Ok(finished) => {
                        dispatcher.inflight.remove(&finished.stream_id);
                        log_access(&AccessRecord {
                            request_id: finished.request_id,
                            method: &finished.method,
                            path: &finished.path,
                            status: finished.response.status,
                            bytes: finished.response.length().unwrap_or(0),
                            duration: finished.started.elapsed(),
                            peer: conn.peer_addr(),
                            protocol: Protocol::Http2,
                        });
                        for push in h2.send_response(finished.stream_id, finished.response) {
                            dispatcher.spawn(ctx, conn, push.promised_id, push.head, Body::empty(), false);
                        }
                    }
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => tracing::error!(connection_id = %conn.id(), error = %e, "Stream task failed"),
                }
            }
            _ = tokio::time::sleep(idle), if quiet && !draining => {
                tracing::debug!(connection_id = %conn.id(), idle_secs = idle.as_secs(), "HTTP/2 connection idle");
                h2.start_drain();
                draining = true;
                conn.transition(ConnectionState::Draining);
            }
            _ = shutdown.recv(), if !draining => {
                h2.start_drain();
                draining = true;
                conn.transition(ConnectionState::Draining);
            }
        }
    }
}

async fn flush<S>(io: &mut S, h2: &mut H2Connection, ctx: &EngineContext, budget: usize) -> Result<(), EngineError>
where
    S: AsyncWrite + Unpin,
{
    loop {
        h2.flush_data(budget);
        if !h2.has_pending_send() {
            return Ok(());
        }
        let out = h2.take_pending_send();
        write_pooled(io, &ctx.pool, &out).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::{AppError, Application, Protocol, Scheme};
    use crate::config::ServerConfig;
    use crate::net::connection::ConnectionTracker;

    fn parsed(headers: &[(&str, &str)]) -> ParsedRequest {
        ParsedRequest {
            method: "GET".to_string(),
            path: "/index".to_string(),
            query: Some("a=1".to_string()),
            version: Protocol::Http11,
            headers: headers.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    #[test]
    fn detects_upgrade_request() {
        let request = parsed(&[
            ("Host", "example.test"),
            ("Connection", "Upgrade, HTTP2-Settings"),
            ("Upgrade", "h2c"),
            ("HTTP2-Settings", "AAMAAABk"),
        ]);
        assert!(is_h2c_upgrade(&request.headers));
        assert!(!is_h2c_upgrade(&parsed(&[("Upgrade", "websocket")]).headers));
        assert!(!is_h2c_upgrade(&parsed(&[("Upgrade", "h2c")]).headers));
    }

    fn head(path: &str) -> RequestHead {
        RequestHead {
            method: "GET".to_string(),
            scheme: "http".to_string(),
            authority: None,
            path: path.to_string(),
            headers: Headers::new(),
        }
    }

    #[tokio::test]
    async fn cancelled_dispatch_never_completes() {
        let app: Arc<dyn Application> = Arc::new(|req: Request| -> Result<Response, AppError> {
            if req.path == "/slow" {
                std::thread::sleep(Duration::from_millis(200));
            }
            Ok(Response::text(200, req.path))
        });
        let ctx = Arc::new(EngineContext::new(ServerConfig::default(), app).unwrap());
        let tracker = ConnectionTracker::new();
        let conn = Connection::new(
            tracker.track(),
            None,
            "127.0.0.1:40000".parse().unwrap(),
            "127.0.0.1:8080".parse().unwrap(),
            Scheme::Http,
        );

        let mut dispatcher = Dispatcher::new();
        dispatcher.spawn(&ctx, &conn, 1, head("/slow"), Body::empty(), false);
        dispatcher.spawn(&ctx, &conn, 3, head("/fast"), Body::empty(), false);
        dispatcher.cancel(1);
        dispatcher.cancel(1);
        assert!(!dispatcher.inflight.contains_key(&1));

        let mut finished = Vec::new();
        let mut cancelled = 0;
        while let Some(joined) = dispatcher.tasks.join_next().await {
            match joined {
                Ok(done) => finished.push(done.stream_id),
                Err(e) if e.is_cancelled() => cancelled += 1,
                Err(e) => panic!("unexpected join error {e}"),
            }
        }
        assert_eq!(finished, vec![3]);
        assert_eq!(cancelled, 1);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn upgrade_strips_hop_headers() {
        let request = parsed(&[
            ("Host", "example.test"),
            ("Connection", "Upgrade, HTTP2-Settings"),
            ("Upgrade", "h2c"),
            ("HTTP2-Settings", "AAMAAABk"),
            ("Accept", "*/*"),
        ]);
        let settings = Settings::from_upgrade_header("AAMAAABk").unwrap();
        let upgrade = H2cUpgrade::new(request, settings);
        assert_eq!(upgrade.settings.max_concurrent_streams, Some(100));
        assert_eq!(upgrade.head.path, "/index?a=1");
        assert_eq!(upgrade.head.authority.as_deref(), Some("example.test"));
        assert_eq!(upgrade.head.headers.get("accept"), Some("*/*"));
        assert!(!upgrade.head.headers.contains("upgrade"));
        assert!(!upgrade.head.headers.contains("http2-settings"));
    }
}
