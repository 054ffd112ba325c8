//! Accept loop and per-connection pipeline.
//!
//! Every accepted socket runs through admission (IP filter, then one rate
//! limit token) before any TLS or HTTP work, then protocol negotiation,
//! then the chosen handler. Shutdown stops the loop, lets connections
//! drain for the grace period and aborts whatever is left.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinSet;

use crate::app::{Protocol, Scheme};
use crate::error::{EngineError, ErrorKind};
use crate::http1::handler::write_status;
use crate::http1::{self, Http1Outcome};
use crate::http2;
use crate::lifecycle::ShutdownSignal;
use crate::net::connection::{Connection, ConnectionState};
use crate::net::listener::{ConnectionPermit, Listener, ListenerError};
use crate::net::negotiate::{negotiate_alpn, negotiate_plaintext, Negotiated};
use crate::net::tls::TlsAcceptor;
use crate::server::EngineContext;

/// Back-off after a failed accept, typically EMFILE.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

pub struct ConnectionAcceptor {
    listener: Listener,
    ctx: Arc<EngineContext>,
    tls: Option<TlsAcceptor>,
}

impl ConnectionAcceptor {
    pub fn new(listener: Listener, ctx: Arc<EngineContext>, tls: Option<TlsAcceptor>) -> Self {
        Self { listener, ctx, tls }
    }

    /// Accept until `shutdown` fires, then drain.
    pub async fn run(self, mut shutdown: ShutdownSignal) -> Result<(), EngineError> {
        let Self { listener, ctx, tls } = self;
        let local = listener.local_addr()?;
        let mut connections = JoinSet::new();

        tracing::info!(
            address = %local,
            tls = tls.is_some(),
            h2 = ctx.config.http2.enabled,
            "Accepting connections"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer, permit)) => {
                        connections.spawn(handle_connection(
                            stream,
                            peer,
                            local,
                            permit,
                            Arc::clone(&ctx),
                            tls.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(ListenerError::Accept(e)) => {
                        tracing::warn!(error = %e, "Accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                    Err(ListenerError::Closed) => break,
                    Err(e) => return Err(EngineError::Transport(e.into_io())),
                },
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::error!(error = %e, "Connection task panicked");
                        }
                    }
                }
            }
        }

        drop(listener);
        let grace = ctx.grace_period();
        tracing::info!(
            active = ctx.tracker.active_count(),
            grace_secs = grace.as_secs(),
            "Stopped accepting, draining connections"
        );
        if ctx.tracker.wait_for_drain(grace).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = ctx.tracker.active_count(),
                "Grace period elapsed, closing remaining connections"
            );
        }
        connections.abort_all();
        while connections.join_next().await.is_some() {}
        Ok(())
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    permit: ConnectionPermit,
    ctx: Arc<EngineContext>,
    tls: Option<TlsAcceptor>,
    shutdown: ShutdownSignal,
) {
    let scheme = if tls.is_some() { Scheme::Https } else { Scheme::Http };
    let mut conn = Connection::new(ctx.tracker.track(), Some(permit), peer, local, scheme);

    if let Err(rejection) = ctx.admit_peer(peer.ip()) {
        // Over TLS there is no cheap way to answer, so the socket is just closed.
        if tls.is_none() {
            let _ = write_status(&mut stream, rejection.status()).await;
            let _ = stream.shutdown().await;
        }
        return;
    }

    let result = match tls {
        Some(acceptor) => serve_tls(stream, acceptor, &mut conn, &ctx, shutdown).await,
        None => serve_plain(stream, &mut conn, &ctx, shutdown).await,
    };
    conn.transition(ConnectionState::Closed);

    match result {
        Ok(()) => tracing::debug!(
            connection_id = %conn.id(),
            peer = %peer,
            requests = conn.requests(),
            "Connection finished"
        ),
        Err(e) if e.is_disconnect() => tracing::debug!(connection_id = %conn.id(), error = %e, "Peer disconnected"),
        Err(e) if e.kind() == ErrorKind::Protocol => {
            tracing::debug!(connection_id = %conn.id(), peer = %peer, error = %e, "Connection closed on protocol error")
        }
        Err(e) => tracing::warn!(
            connection_id = %conn.id(),
            peer = %peer,
            kind = e.kind().as_str(),
            error = %e,
            "Connection failed"
        ),
    }
}

async fn serve_plain(
    mut stream: TcpStream,
    conn: &mut Connection,
    ctx: &Arc<EngineContext>,
    shutdown: ShutdownSignal,
) -> Result<(), EngineError> {
    let read_timeout = Duration::from_secs(ctx.config.http1.read_timeout_secs);
    let negotiated = negotiate_plaintext(&mut stream, &ctx.pool, ctx.config.http2.enabled, read_timeout).await?;
    let result = match negotiated {
        None => Ok(()),
        Some(Negotiated::Http2(buf)) => http2::serve(&mut stream, buf, conn, ctx, shutdown, None).await,
        Some(Negotiated::Http1(buf)) => match http1::serve(&mut stream, buf, conn, ctx, shutdown.clone(), true).await {
            Ok(Http1Outcome::Closed) => Ok(()),
            Ok(Http1Outcome::Upgrade(upgrade, rest)) => {
                http2::serve(&mut stream, rest, conn, ctx, shutdown, Some(upgrade)).await
            }
            Err(e) => Err(e),
        },
    };
    let _ = stream.shutdown().await;
    result
}

async fn serve_tls(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    conn: &mut Connection,
    ctx: &Arc<EngineContext>,
    shutdown: ShutdownSignal,
) -> Result<(), EngineError> {
    let handshake_timeout = Duration::from_secs(ctx.config.http1.read_timeout_secs);
    let mut tls_stream = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => tls_stream,
        Ok(Err(e)) => return Err(EngineError::Transport(e)),
        Err(_) => return Err(EngineError::Protocol("TLS handshake timed out".to_string())),
    };

    let alpn = tls_stream.get_ref().1.alpn_protocol().map(<[u8]>::to_vec);
    let protocol = negotiate_alpn(alpn.as_deref());
    let offered = alpn.as_deref().map(String::from_utf8_lossy);
    tracing::debug!(
        connection_id = %conn.id(),
        alpn = ?offered,
        protocol = %protocol,
        "TLS handshake complete"
    );
    conn.set_alpn(alpn);

    let result = match protocol {
        Protocol::Http2 => http2::serve(&mut tls_stream, BytesMut::new(), conn, ctx, shutdown, None).await,
        _ => http1::serve(&mut tls_stream, BytesMut::new(), conn, ctx, shutdown, false)
            .await
            .map(|_| ()),
    };
    let _ = tls_stream.shutdown().await;
    result
}
