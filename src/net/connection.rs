//! Connection state machine and lifecycle tracking.
//!
//! # Responsibilities
//! - Track connection state (Accepting → Active → Draining → Closed)
//! - Generate unique connection IDs for tracing
//! - Count live connections for graceful shutdown
//! - Keep per-connection request counters and activity timestamps

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::app::{Protocol, RequestContext, Scheme};
use crate::net::listener::ConnectionPermit;

/// Global atomic counter for connection IDs.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection lifecycle state. Ordered; transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted, admission and negotiation in progress.
    Accepting,
    /// Serving requests.
    Active,
    /// No new requests; finishing in-flight ones.
    Draining,
    Closed,
}

/// One accepted client connection, owned by a single task.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    scheme: Scheme,
    protocol: Option<Protocol>,
    alpn: Option<Vec<u8>>,
    state: ConnectionState,
    requests: u64,
    last_activity: Instant,
    _guard: ConnectionGuard,
    _permit: Option<ConnectionPermit>,
}

impl Connection {
    pub fn new(
        guard: ConnectionGuard,
        permit: Option<ConnectionPermit>,
        peer_addr: SocketAddr,
        local_addr: SocketAddr,
        scheme: Scheme,
    ) -> Self {
        Self {
            id: guard.id(),
            peer_addr,
            local_addr,
            scheme,
            protocol: None,
            alpn: None,
            state: ConnectionState::Accepting,
            requests: 0,
            last_activity: Instant::now(),
            _guard: guard,
            _permit: permit,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn protocol(&self) -> Option<Protocol> {
        self.protocol
    }

    pub fn alpn(&self) -> Option<&[u8]> {
        self.alpn.as_deref()
    }

    pub fn set_alpn(&mut self, alpn: Option<Vec<u8>>) {
        self.alpn = alpn;
    }

    /// Bind the negotiated protocol. The first choice sticks.
    pub fn set_protocol(&mut self, protocol: Protocol) {
        if self.protocol.is_none() {
            self.protocol = Some(protocol);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Move to `next` if it is later than the current state.
    pub fn transition(&mut self, next: ConnectionState) -> bool {
        if next <= self.state {
            return false;
        }
        tracing::trace!(connection_id = %self.id, from = ?self.state, to = ?next, "Connection state");
        self.state = next;
        true
    }

    /// Count a request and return the new total.
    pub fn record_request(&mut self) -> u64 {
        self.requests += 1;
        self.last_activity = Instant::now();
        self.requests
    }

    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Context handed to the application with each request.
    pub fn request_context(&self, protocol: Protocol) -> RequestContext {
        RequestContext::new(self.peer_addr, self.local_addr, self.scheme, protocol)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.state = ConnectionState::Closed;
    }
}

/// Tracks active connections for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    active_count: Arc<AtomicU64>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new active connection. Returns a guard that decrements on drop.
    pub fn track(&self) -> ConnectionGuard {
        let count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::gauge!("connections_active").set(count as f64);
        ConnectionGuard {
            active_count: Arc::clone(&self.active_count),
            id: ConnectionId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        self.active_count.load(Ordering::SeqCst)
    }

    /// Wait until all connections are closed or the grace period runs out.
    /// Returns true if every connection finished.
    pub async fn wait_for_drain(&self, grace: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + grace;
        while self.active_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

/// Guard that tracks a connection's lifetime.
/// Decrements active count when dropped.
#[derive(Debug)]
pub struct ConnectionGuard {
    active_count: Arc<AtomicU64>,
    id: ConnectionId,
}

impl ConnectionGuard {
    pub fn id(&self) -> ConnectionId {
        self.id
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let count = self.active_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::gauge!("connections_active").set(count as f64);
        tracing::trace!(connection_id = %self.id, "Connection closed");
    }
}
