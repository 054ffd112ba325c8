//! HTTP/1.1 connection handler.
//!
//! Requests are decoded as they arrive and dispatched concurrently, up to
//! `http1.max_pipeline_depth` at a time. Responses go back to the socket
//! strictly in arrival order through a [`PipelineQueue`].

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

use super::parser::{DecodeEvent, ParsedRequest, RequestDecoder};
use super::pipeline::PipelineQueue;
use crate::app::{is_bodiless, pull_chunk, reason_phrase, Protocol, Request, Response, SERVER_NAME};
use crate::buffer::SizeClass;
use crate::error::EngineError;
use crate::http2::{is_h2c_upgrade, H2cUpgrade, Settings};
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionState};
use crate::net::io::read_pooled;
use crate::observability::{log_access, AccessRecord};
use crate::server::EngineContext;

const CONTINUE: &[u8] = b"HTTP/1.1 100 Continue\r\n\r\n";

/// How an HTTP/1.1 connection ended.
#[derive(Debug)]
pub enum Http1Outcome {
    Closed,
    /// The first request asked for h2c; the caller continues with HTTP/2.
    /// Carries the bytes read past the upgrading request.
    Upgrade(H2cUpgrade, BytesMut),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Empty,
    Length(u64),
    Chunked,
    /// HTTP/1.0 without a known length: the body ends when the connection does.
    UntilClose,
}

/// A dispatched request's response plus what is needed to write and log it.
struct Finished {
    response: Response,
    version: Protocol,
    head_only: bool,
    /// Last response on this connection.
    close: bool,
    request_id: Uuid,
    method: String,
    path: String,
    started: Instant,
}

struct KeepAlive {
    max_depth: usize,
    max_requests: u64,
    idle: Duration,
    read: Duration,
    allow_upgrade: bool,
}

/// Serve HTTP/1.1 on `io`. `buf` holds bytes already read during
/// negotiation. `allow_upgrade` enables h2c on the first request.
pub async fn serve<S>(
    io: &mut S,
    mut buf: BytesMut,
    conn: &mut Connection,
    ctx: &Arc<EngineContext>,
    mut shutdown: ShutdownSignal,
    allow_upgrade: bool,
) -> Result<Http1Outcome, EngineError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let http1 = &ctx.config.http1;
    let settings = KeepAlive {
        max_depth: http1.max_pipeline_depth.max(1),
        max_requests: http1.max_requests.max(1) as u64,
        idle: Duration::from_secs(http1.idle_timeout_secs),
        read: Duration::from_secs(http1.read_timeout_secs),
        allow_upgrade: allow_upgrade && ctx.config.http2.enabled,
    };
    conn.transition(ConnectionState::Active);

    let mut decoder = RequestDecoder::new(ctx.limits.clone());
    let mut queue: PipelineQueue<Finished> = PipelineQueue::new();
    let mut tasks: JoinSet<(u64, Finished)> = JoinSet::new();
    let mut request_started: Option<Instant> = None;
    let mut owe_continue = false;
    let mut closing = false;
    let mut eof = false;
    let mut failure: Option<u16> = None;

    loop {
        while !closing && failure.is_none() && queue.pending() < settings.max_depth {
            match decoder.decode(&mut buf) {
                Ok(None) => break,
                Ok(Some(DecodeEvent::ExpectContinue)) => owe_continue = true,
                Ok(Some(DecodeEvent::Request(parsed))) => {
                    owe_continue = false;
                    if settings.allow_upgrade && conn.requests() == 0 && queue.is_empty() {
                        if let Some(upgrade) = h2c_upgrade(&parsed) {
                            return Ok(Http1Outcome::Upgrade(H2cUpgrade::new(parsed, upgrade), buf.split()));
                        }
                    }
                    conn.set_protocol(Protocol::Http11);
                    let count = conn.record_request();
                    let close = !parsed.keep_alive || count >= settings.max_requests || shutdown.is_triggered();
                    closing |= close;
                    let seq = queue.assign();
                    dispatch(&mut tasks, ctx, conn, seq, parsed, close, count > 1);
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %conn.id(),
                        peer = %conn.peer_addr(),
                        error = %e,
                        status = e.status(),
                        "Rejecting HTTP/1.1 request"
                    );
                    failure = Some(e.status());
                }
            }
        }

        while let Some(finished) = queue.pop_ready() {
            let close = finished.close;
            match write_response(io, ctx, finished, conn.peer_addr()).await {
                Ok(true) => {}
                Ok(false) => return Ok(Http1Outcome::Closed),
                Err(EngineError::ResourceExhaustion(reason)) => {
                    tracing::warn!(connection_id = %conn.id(), reason = %reason, "No buffer for response");
                    write_status(io, 503).await?;
                    return Ok(Http1Outcome::Closed);
                }
                Err(e) => return Err(e),
            }
            conn.touch();
            if close {
                return Ok(Http1Outcome::Closed);
            }
        }

        if queue.is_empty() {
            if let Some(status) = failure {
                write_status(io, status).await?;
                return Ok(Http1Outcome::Closed);
            }
            if closing || eof {
                return Ok(Http1Outcome::Closed);
            }
            if owe_continue {
                io.write_all(CONTINUE).await?;
                io.flush().await?;
                owe_continue = false;
            }
        }

        if decoder.in_progress(&buf) {
            request_started.get_or_insert_with(Instant::now);
        } else {
            request_started = None;
        }
        let deadline = match request_started {
            Some(started) => Some(started + settings.read),
            None if queue.is_empty() => Some(Instant::now() + settings.idle.saturating_sub(conn.idle_for())),
            None => None,
        };
        let reading = !closing && !eof && failure.is_none() && queue.pending() < settings.max_depth;

        tokio::select! {
            read = read_pooled(io, &ctx.pool, &mut buf), if reading => {
                match read {
                    Ok(0) => {
                        tracing::debug!(connection_id = %conn.id(), "Peer closed HTTP/1.1 connection");
                        eof = true;
                    }
                    Ok(_) => conn.touch(),
                    Err(EngineError::ResourceExhaustion(reason)) => {
                        tracing::warn!(connection_id = %conn.id(), reason = %reason, "No buffer for request");
                        failure = Some(503);
                    }
                    Err(e) => return Err(e),
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                let (seq, finished) = joined.map_err(|e| EngineError::Application(e.to_string()))?;
                queue.complete(seq, finished);
            }
            _ = sleep_until(deadline), if deadline.is_some() && failure.is_none() => {
                if request_started.is_some() {
                    tracing::debug!(connection_id = %conn.id(), "Request not received in time");
                    failure = Some(408);
                } else {
                    tracing::debug!(connection_id = %conn.id(), idle_secs = settings.idle.as_secs(), "Keep-alive connection idle");
                    return Ok(Http1Outcome::Closed);
                }
            }
            _ = shutdown.recv(), if !closing => {
                closing = true;
                conn.transition(ConnectionState::Draining);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Settings carried by a valid h2c upgrade request on HTTP/1.1.
fn h2c_upgrade(request: &ParsedRequest) -> Option<Settings> {
    if request.version != Protocol::Http11 || !is_h2c_upgrade(&request.headers) {
        return None;
    }
    let value = request.headers.get("http2-settings")?;
    match Settings::from_upgrade_header(value) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::debug!(error = %e, "Ignoring h2c upgrade with bad HTTP2-Settings");
            None
        }
    }
}

fn dispatch(
    tasks: &mut JoinSet<(u64, Finished)>,
    ctx: &Arc<EngineContext>,
    conn: &Connection,
    seq: u64,
    parsed: ParsedRequest,
    close: bool,
    charge: bool,
) {
    let version = parsed.version;
    let head_only = parsed.is_head();
    let request = Request {
        method: parsed.method,
        path: parsed.path,
        query: parsed.query,
        version,
        headers: parsed.headers,
        body: parsed.body,
        context: conn.request_context(version),
    };
    let ctx = Arc::clone(ctx);
    tasks.spawn(async move {
        let started = Instant::now();
        let request_id = request.context.request_id;
        let method = request.method.clone();
        let path = request.path.clone();
        let response = ctx.handle(request, charge).await;
        let finished = Finished {
            response,
            version,
            head_only,
            close,
            request_id,
            method,
            path,
            started,
        };
        (seq, finished)
    });
}

fn framing(status: u16, head_only: bool, length: Option<u64>, version: Protocol) -> Framing {
    if head_only || is_bodiless(status) {
        Framing::Empty
    } else if let Some(len) = length {
        Framing::Length(len)
    } else if version == Protocol::Http11 {
        Framing::Chunked
    } else {
        Framing::UntilClose
    }
}

/// Serialize and write one response. Returns whether the connection can
/// carry another one.
async fn write_response<S>(
    io: &mut S,
    ctx: &EngineContext,
    finished: Finished,
    peer: std::net::SocketAddr,
) -> Result<bool, EngineError>
where
    S: AsyncWrite + Unpin,
{
    let Finished {
        response,
        version,
        head_only,
        mut close,
        request_id,
        method,
        path,
        started,
    } = finished;
    let (status, mut headers, mut body, length, _) = response.into_parts();

    let declared = headers
        .get("content-length")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .or(length);
    for name in ["connection", "keep-alive", "transfer-encoding", "content-length"] {
        headers.remove(name);
    }
    let framing = framing(status, head_only, declared, version);
    if framing == Framing::UntilClose {
        close = true;
    }

    if !headers.contains("server") {
        headers.append("server", SERVER_NAME);
    }
    match (framing, declared) {
        (Framing::Chunked, _) => headers.append("transfer-encoding", "chunked"),
        (_, Some(len)) if !is_bodiless(status) => headers.append("content-length", len.to_string()),
        _ => {}
    }
    if close {
        headers.append("connection", "close");
    } else if version == Protocol::Http10 {
        headers.append("connection", "keep-alive");
    }

    let mut out = ctx.pool.acquire(SizeClass::Large).await?;
    let flush_at = ctx.config.buffers.large_buffer_size.max(1);
    out.extend_from_slice(format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status)).as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");

    let mut sent: u64 = 0;
    let mut body_failed = false;
    if framing != Framing::Empty {
        loop {
            let mut chunk = match pull_chunk(&mut body) {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) => {
                    // The response is cut short; closing tells the client.
                    tracing::error!(request_id = %request_id, error = %e, "Response body failed");
                    body_failed = true;
                    close = true;
                    break;
                }
            };
            if chunk.is_empty() {
                continue;
            }
            if let Framing::Length(len) = framing {
                let room = len - sent;
                if room == 0 {
                    break;
                }
                if chunk.len() as u64 > room {
                    chunk.truncate(room as usize);
                }
            }
            if framing == Framing::Chunked {
                out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            }
            out.extend_from_slice(&chunk);
            if framing == Framing::Chunked {
                out.extend_from_slice(b"\r\n");
            }
            sent += chunk.len() as u64;
            if out.len() >= flush_at {
                io.write_all(&out).await?;
                out.clear();
            }
        }
        match framing {
            _ if body_failed => {}
            Framing::Chunked => out.extend_from_slice(b"0\r\n\r\n"),
            Framing::Length(len) if sent < len => {
                tracing::warn!(request_id = %request_id, declared = len, sent, "Response body shorter than Content-Length");
                close = true;
            }
            _ => {}
        }
    }
    io.write_all(&out).await?;
    io.flush().await?;

    log_access(&AccessRecord {
        request_id,
        method: &method,
        path: &path,
        status,
        bytes: sent,
        duration: started.elapsed(),
        peer,
        protocol: version,
    });
    Ok(!close)
}

/// Bare status response sent by the engine itself, always closing.
pub(crate) async fn write_status<S>(io: &mut S, status: u16) -> Result<(), EngineError>
where
    S: AsyncWrite + Unpin,
{
    let reason = reason_phrase(status);
    let message = format!(
        "HTTP/1.1 {status} {reason}\r\nserver: {SERVER_NAME}\r\ncontent-type: text/plain; charset=utf-8\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reason}",
        reason.len()
    );
    io.write_all(message.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}
