//! Per-stream state (RFC 7540 Section 5.1).

use bytes::Bytes;

use super::flow::{ReceiveWindow, Window};
use super::frame::PrioritySpec;
use crate::app::{pull_chunk, AppError, Body, BodyStream, Headers};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
    Reset,
}

/// Request head captured from the HEADERS block.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub authority: Option<String>,
    pub path: String,
    pub headers: Headers,
}

/// Response body waiting on flow-control credit.
pub(crate) struct Outgoing {
    pub current: Bytes,
    pub source: Option<BodyStream>,
}

impl Outgoing {
    pub fn new(source: BodyStream) -> Self {
        Self {
            current: Bytes::new(),
            source: Some(source),
        }
    }

    /// Next non-empty chunk, or `None` once the body is exhausted. A
    /// failing body source is dropped.
    pub fn next_chunk(&mut self) -> Result<Option<Bytes>, AppError> {
        if !self.current.is_empty() {
            return Ok(Some(std::mem::take(&mut self.current)));
        }
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        loop {
            match pull_chunk(source) {
                Ok(Some(chunk)) if chunk.is_empty() => continue,
                Ok(Some(chunk)) => return Ok(Some(chunk)),
                Ok(None) => {
                    self.source = None;
                    return Ok(None);
                }
                Err(e) => {
                    self.source = None;
                    return Err(e);
                }
            }
        }
    }
}

pub(crate) struct Stream {
    pub id: u32,
    pub state: StreamState,
    pub send_window: Window,
    pub recv_window: ReceiveWindow,
    pub priority: PrioritySpec,
    pub head: Option<RequestHead>,
    pub body: Body,
    pub head_only: bool,
    /// Answered by the engine before the request finished; further DATA is
    /// discarded.
    pub rejected: bool,
    pub outgoing: Option<Outgoing>,
}

impl Stream {
    pub fn new(id: u32, send_window: u32, recv_window: u32) -> Self {
        Self {
            id,
            state: StreamState::Idle,
            send_window: Window::new(send_window),
            recv_window: ReceiveWindow::new(recv_window),
            priority: PrioritySpec {
                exclusive: false,
                dependency: 0,
                weight: 16,
            },
            head: None,
            body: Body::empty(),
            head_only: false,
            rejected: false,
            outgoing: None,
        }
    }

    pub fn open(&mut self) {
        if self.state == StreamState::Idle {
            self.state = StreamState::Open;
        }
    }

    /// Counts against MAX_CONCURRENT_STREAMS.
    pub fn is_active(&self) -> bool {
        matches!(
            self.state,
            StreamState::Open | StreamState::HalfClosedLocal | StreamState::HalfClosedRemote
        )
    }

    pub fn can_receive(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    pub fn is_done(&self) -> bool {
        matches!(self.state, StreamState::Closed | StreamState::Reset)
    }

    pub fn recv_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedRemote,
            StreamState::HalfClosedLocal => StreamState::Closed,
            other => other,
        };
    }

    pub fn send_end_stream(&mut self) {
        self.state = match self.state {
            StreamState::Idle | StreamState::Open => StreamState::HalfClosedLocal,
            StreamState::HalfClosedRemote => StreamState::Closed,
            other => other,
        };
        self.outgoing = None;
    }

    /// Drops buffered request and response data along with the state.
    pub fn reset(&mut self) {
        if self.state != StreamState::Closed {
            self.state = StreamState::Reset;
        }
        self.outgoing = None;
        self.body = Body::empty();
        self.head = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_then_response_closes() {
        let mut s = Stream::new(1, 100, 100);
        s.open();
        assert!(s.can_receive() && s.can_send());
        s.recv_end_stream();
        assert_eq!(s.state, StreamState::HalfClosedRemote);
        assert!(!s.can_receive());
        assert!(s.is_active());
        s.send_end_stream();
        assert_eq!(s.state, StreamState::Closed);
        assert!(s.is_done());
    }

    #[test]
    fn states_only_move_forward() {
        let mut s = Stream::new(3, 100, 100);
        s.open();
        s.send_end_stream();
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.open();
        assert_eq!(s.state, StreamState::HalfClosedLocal);
        s.reset();
        assert_eq!(s.state, StreamState::Reset);
        s.recv_end_stream();
        assert_eq!(s.state, StreamState::Reset);
    }

    #[test]
    fn outgoing_skips_empty_chunks() {
        let chunks = vec![Bytes::new(), Bytes::from_static(b"ab"), Bytes::new()];
        let mut out = Outgoing::new(Box::new(chunks.into_iter()));
        assert_eq!(out.next_chunk().unwrap(), Some(Bytes::from_static(b"ab")));
        assert_eq!(out.next_chunk().unwrap(), None);
        assert!(out.source.is_none());
    }
}
