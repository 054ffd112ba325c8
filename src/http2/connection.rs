//! Sans-IO HTTP/2 server connection.
//!
//! Bytes read from the socket go in through [`H2Connection::recv`], complete
//! requests come out of [`H2Connection::poll_event`], and every frame the
//! server emits is queued in an output buffer drained with
//! [`H2Connection::take_pending_send`]. The async driver in `handler.rs`
//! owns the socket and the application dispatch.
//!
//! Connection errors queue a GOAWAY and are returned from `recv`; stream
//! errors queue a RST_STREAM and processing continues.

use std::cmp::Reverse;
use std::collections::{BTreeMap, VecDeque};

use bytes::{Buf, Bytes, BytesMut};

use super::error::{ErrorCode, H2Error};
use super::flow::{ReceiveWindow, Window};
use super::frame::{self, Frame, PrioritySpec, PREFACE};
use super::hpack::{Decoder, Encoder, HeaderField};
use super::settings::{Settings, DEFAULT_WINDOW_SIZE};
use super::stream::{Outgoing, RequestHead, Stream};
use crate::app::{is_bodiless, split_target, Body, Headers, Response, SERVER_NAME};
use crate::config::Http2Config;
use crate::observability::metrics::record_refused_stream;
use crate::security::{LimitViolation, RequestLimits};

/// Header fields that only make sense on a single HTTP/1.1 hop.
const CONNECTION_SPECIFIC: &[&str] = &["connection", "keep-alive", "proxy-connection", "transfer-encoding", "upgrade"];

const MAX_STREAM_ID: u32 = 0x7fff_ffff;

/// Upper bound on the HPACK encoder table, whatever the peer allows.
const MAX_ENCODER_TABLE: u32 = 65_536;

/// How many reset stream ids are remembered for dropping late frames.
const RESET_MEMORY: usize = 256;

#[derive(Debug)]
pub enum H2Event {
    /// A stream's request has been fully received.
    Request {
        stream_id: u32,
        head: RequestHead,
        body: Body,
    },
    /// The stream was reset; any pending dispatch for it is moot.
    StreamReset { stream_id: u32 },
}

/// A push promised to the client; its response is still owed.
#[derive(Debug, Clone)]
pub struct PushRequest {
    pub promised_id: u32,
    pub head: RequestHead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Waiting for the 24-byte client preface.
    Preface,
    /// Preface seen; the next frame must be SETTINGS.
    Settings,
    Open,
    /// GOAWAY with an error code queued; input is ignored.
    Closed,
}

/// What to do with a header block once END_HEADERS arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Open,
    Trailers,
    Refuse,
    Reset(ErrorCode),
    /// The stream was already reset; decode for HPACK state, then drop.
    Discard,
}

struct HeaderBlock {
    stream_id: u32,
    fragments: BytesMut,
    end_stream: bool,
    priority: Option<PrioritySpec>,
    disposition: Disposition,
}

enum HeadError {
    Malformed(&'static str),
    Limit(LimitViolation),
}

pub struct H2Connection {
    phase: Phase,
    local: Settings,
    remote: Settings,
    limits: RequestLimits,
    streams: BTreeMap<u32, Stream>,
    /// Highest client stream id seen, for monotonicity.
    last_client_stream: u32,
    /// Highest client stream id accepted for processing, for GOAWAY.
    last_processed: u32,
    next_push_id: u32,
    send_window: Window,
    recv_window: ReceiveWindow,
    encoder: Encoder,
    decoder: Decoder,
    header_block: Option<HeaderBlock>,
    goaway_sent: Option<u32>,
    goaway_received: Option<u32>,
    /// Recently reset streams, oldest first.
    recently_reset: VecDeque<u32>,
    events: VecDeque<H2Event>,
    out: BytesMut,
}

impl H2Connection {
    /// New server connection. Our SETTINGS (and a connection WINDOW_UPDATE
    /// when the configured window is above the protocol default) are queued
    /// immediately.
    pub fn new(config: &Http2Config, limits: RequestLimits) -> Self {
        let local = Settings::local(config);
        let mut conn = Self {
            phase: Phase::Preface,
            local,
            remote: Settings::default(),
            limits,
            streams: BTreeMap::new(),
            last_client_stream: 0,
            last_processed: 0,
            next_push_id: 2,
            send_window: Window::new(DEFAULT_WINDOW_SIZE),
            recv_window: ReceiveWindow::new(local.initial_window_size.max(DEFAULT_WINDOW_SIZE)),
            encoder: Encoder::new(Settings::default().header_table_size as usize),
            decoder: Decoder::new(local.header_table_size as usize),
            header_block: None,
            goaway_sent: None,
            goaway_received: None,
            recently_reset: VecDeque::new(),
            events: VecDeque::new(),
            out: BytesMut::new(),
        };
        conn.queue(Frame::Settings {
            ack: false,
            values: local.to_values(),
        });
        if local.initial_window_size > DEFAULT_WINDOW_SIZE {
            conn.queue(Frame::WindowUpdate {
                stream_id: 0,
                increment: local.initial_window_size - DEFAULT_WINDOW_SIZE,
            });
        }
        conn
    }

    /// Connection switched from HTTP/1.1 by an h2c upgrade. The upgrading
    /// request becomes stream 1, already half-closed by the client, and is
    /// reported as the first event.
    pub fn upgraded(
        config: &Http2Config,
        limits: RequestLimits,
        remote: Settings,
        head: RequestHead,
        body: Body,
    ) -> Self {
        let mut conn = Self::new(config, limits);
        if remote.header_table_size != conn.remote.header_table_size {
            conn.encoder
                .set_max_table_size(remote.header_table_size.min(MAX_ENCODER_TABLE) as usize);
        }
        conn.remote = remote;

        let mut stream = Stream::new(1, remote.initial_window_size, conn.local.initial_window_size);
        stream.open();
        stream.recv_end_stream();
        stream.head_only = head.method == "HEAD";
        stream.head = Some(head.clone());
        conn.streams.insert(1, stream);
        conn.last_client_stream = 1;
        conn.last_processed = 1;
        conn.events.push_back(H2Event::Request {
            stream_id: 1,
            head,
            body,
        });
        conn
    }

    /// Consume as many complete frames from `buf` as possible.
    pub fn recv(&mut self, buf: &mut BytesMut) -> Result<(), H2Error> {
        let result = self.process(buf);
        self.collect_closed();
        if let Err(H2Error::Connection { code, reason }) = &result {
            self.fail(*code, *reason);
        }
        result
    }

    pub fn poll_event(&mut self) -> Option<H2Event> {
        self.events.pop_front()
    }

    pub fn take_pending_send(&mut self) -> BytesMut {
        self.out.split()
    }

    pub fn has_pending_send(&self) -> bool {
        !self.out.is_empty()
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    /// Client streams currently counted against MAX_CONCURRENT_STREAMS.
    pub fn active_streams(&self) -> usize {
        self.streams
            .iter()
            .filter(|(id, s)| *id % 2 == 1 && s.is_active())
            .count()
    }

    /// True while any stream, pushed ones included, is unfinished.
    pub fn has_open_streams(&self) -> bool {
        self.streams.values().any(Stream::is_active)
    }

    pub fn last_processed(&self) -> u32 {
        self.last_processed
    }

    /// Send GOAWAY(NO_ERROR) and refuse new streams. Streams already
    /// accepted run to completion.
    pub fn start_drain(&mut self) {
        if self.goaway_sent.is_none() && self.phase != Phase::Closed {
            self.goaway_sent = Some(self.last_processed);
            self.queue(Frame::GoAway {
                last_stream_id: self.last_processed,
                code: ErrorCode::NoError,
                debug: Bytes::new(),
            });
        }
    }

    pub fn is_draining(&self) -> bool {
        self.goaway_sent.is_some()
    }

    /// The peer sent GOAWAY; no new streams will be accepted.
    pub fn peer_going_away(&self) -> bool {
        self.goaway_received.is_some()
    }

    /// Queue the response for `stream_id`. Returns the pushes promised
    /// alongside it; the caller owes a response for each.
    ///
    /// Body bytes are moved out by [`H2Connection::flush_data`].
    pub fn send_response(&mut self, stream_id: u32, response: Response) -> Vec<PushRequest> {
        let Some(stream) = self.streams.get(&stream_id) else {
            return Vec::new();
        };
        if !stream.can_send() || self.phase == Phase::Closed {
            return Vec::new();
        }
        let head_only = stream.head_only;
        let origin = stream.head.clone();
        let (status, mut headers, body, length, push) = response.into_parts();

        let pushes = if !push.is_empty() && self.push_allowed() {
            self.promise(stream_id, origin.as_ref(), push)
        } else {
            Vec::new()
        };

        for name in CONNECTION_SPECIFIC {
            headers.remove(name);
        }
        if !headers.contains("server") {
            headers.append("server", SERVER_NAME);
        }
        if let Some(len) = length {
            if !is_bodiless(status) && !headers.contains("content-length") {
                headers.append("content-length", len.to_string());
            }
        }
        let no_body = head_only || is_bodiless(status) || length == Some(0);

        let status = status.to_string();
        let lowered: Vec<(String, &str)> = headers
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value))
            .collect();
        let mut block = Vec::new();
        self.encoder.encode(
            std::iter::once((&b":status"[..], status.as_bytes()))
                .chain(lowered.iter().map(|(n, v)| (n.as_bytes(), v.as_bytes()))),
            &mut block,
        );
        self.queue_headers(stream_id, Bytes::from(block), no_body);

        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if no_body {
                stream.send_end_stream();
            } else {
                stream.outgoing = Some(Outgoing::new(body));
            }
        }
        self.collect_closed();
        pushes
    }

    /// Move pending response bytes into the output buffer as both flow
    /// control windows allow, stopping once `budget` bytes are queued.
    /// Streams with a higher weight go first, ties go to the lower id.
    pub fn flush_data(&mut self, budget: usize) {
        let mut order: Vec<(Reverse<u8>, u32)> = self
            .streams
            .iter()
            .filter(|(_, s)| s.outgoing.is_some() && s.can_send())
            .map(|(id, s)| (Reverse(s.priority.weight), *id))
            .collect();
        order.sort_unstable();

        let max_frame = self.remote.max_frame_size as usize;
        'streams: for (_, id) in order {
            loop {
                if self.out.len() >= budget {
                    break 'streams;
                }
                let Some(stream) = self.streams.get_mut(&id) else {
                    break;
                };
                let Some(outgoing) = stream.outgoing.as_mut() else {
                    break;
                };
                let next = match outgoing.next_chunk() {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(stream_id = id, error = %e, "Response body failed");
                        self.reset_stream(id, ErrorCode::InternalError);
                        break;
                    }
                };
                let Some(mut chunk) = next else {
                    stream.send_end_stream();
                    Frame::Data {
                        stream_id: id,
                        data: Bytes::new(),
                        end_stream: true,
                        flow_len: 0,
                    }
                    .encode(&mut self.out);
                    break;
                };
                let room = self
                    .send_window
                    .sendable()
                    .min(stream.send_window.sendable())
                    .min(max_frame);
                if room == 0 {
                    outgoing.current = chunk;
                    break;
                }
                if chunk.len() > room {
                    outgoing.current = chunk.split_off(room);
                }
                let n = chunk.len() as u32;
                let _ = self.send_window.consume(n);
                let _ = stream.send_window.consume(n);
                Frame::Data {
                    stream_id: id,
                    data: chunk,
                    end_stream: false,
                    flow_len: n,
                }
                .encode(&mut self.out);
            }
        }
        self.collect_closed();
    }

    fn process(&mut self, buf: &mut BytesMut) -> Result<(), H2Error> {
        if self.phase == Phase::Closed {
            buf.clear();
            return Ok(());
        }
        if self.phase == Phase::Preface {
            let n = buf.len().min(PREFACE.len());
            if buf[..n] != PREFACE[..n] {
                return Err(protocol("invalid connection preface"));
            }
            if n < PREFACE.len() {
                return Ok(());
            }
            buf.advance(PREFACE.len());
            self.phase = Phase::Settings;
        }

        loop {
            let result = match frame::decode(buf, self.local.max_frame_size) {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => return Ok(()),
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {}
                Err(H2Error::Stream { stream_id, code }) => self.reset_stream(stream_id, code),
                Err(e) => return Err(e),
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), H2Error> {
        if self.phase == Phase::Settings && !matches!(frame, Frame::Settings { ack: false, .. }) {
            return Err(protocol("first frame must be SETTINGS"));
        }
        if let Some(pending) = &self.header_block {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => {}
                _ => return Err(protocol("frame interleaved with header block")),
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                data,
                end_stream,
                flow_len,
            } => self.on_data(stream_id, data, end_stream, flow_len),
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => self.on_headers(stream_id, block, end_stream, end_headers, priority),
            Frame::Continuation {
                stream_id: _,
                block,
                end_headers,
            } => self.on_continuation(block, end_headers),
            Frame::Priority { stream_id, priority } => {
                if let (Some(spec), Some(stream)) = (priority, self.streams.get_mut(&stream_id)) {
                    stream.priority = spec;
                }
                Ok(())
            }
            Frame::RstStream { stream_id, code } => self.on_rst(stream_id, code),
            Frame::Settings { ack, values } => self.on_settings(ack, &values),
            Frame::PushPromise { .. } => Err(protocol("PUSH_PROMISE from client")),
            Frame::Ping { ack, payload } => {
                if !ack {
                    self.queue(Frame::Ping { ack: true, payload });
                }
                Ok(())
            }
            Frame::GoAway {
                last_stream_id, code, ..
            } => {
                self.on_goaway(last_stream_id, code);
                Ok(())
            }
            Frame::WindowUpdate { stream_id, increment } => self.on_window_update(stream_id, increment),
            Frame::Unknown { .. } => Ok(()),
        }
    }

    fn on_headers(
        &mut self,
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
    ) -> Result<(), H2Error> {
        if stream_id % 2 == 0 {
            return Err(protocol("even stream id from client"));
        }
        let disposition = match self.streams.get(&stream_id) {
            _ if self.was_reset(stream_id) => Disposition::Discard,
            Some(stream) if stream.can_receive() && end_stream => Disposition::Trailers,
            Some(stream) if stream.can_receive() => Disposition::Reset(ErrorCode::ProtocolError),
            Some(_) => Disposition::Reset(ErrorCode::StreamClosed),
            None if stream_id <= self.last_client_stream => {
                return Err(protocol("stream id not increasing"));
            }
            None => {
                self.last_client_stream = stream_id;
                let limit = self.local.max_concurrent_streams.unwrap_or(u32::MAX) as usize;
                if self.goaway_sent.is_some() || self.goaway_received.is_some() || self.active_streams() >= limit {
                    Disposition::Refuse
                } else {
                    Disposition::Open
                }
            }
        };

        self.header_block = Some(HeaderBlock {
            stream_id,
            fragments: BytesMut::from(&block[..]),
            end_stream,
            priority,
            disposition,
        });
        self.check_block_size()?;
        if end_headers {
            self.finish_header_block()?;
        }
        Ok(())
    }

    fn on_continuation(&mut self, block: Bytes, end_headers: bool) -> Result<(), H2Error> {
        let Some(pending) = self.header_block.as_mut() else {
            return Err(protocol("CONTINUATION without HEADERS"));
        };
        pending.fragments.extend_from_slice(&block);
        self.check_block_size()?;
        if end_headers {
            self.finish_header_block()?;
        }
        Ok(())
    }

    fn check_block_size(&self) -> Result<(), H2Error> {
        let Some(pending) = &self.header_block else {
            return Ok(());
        };
        let limit = self
            .local
            .max_header_list_size
            .map_or(usize::MAX, |max| (max as usize).saturating_mul(2));
        if pending.fragments.len() > limit {
            return Err(H2Error::connection(ErrorCode::EnhanceYourCalm, "header block too large"));
        }
        Ok(())
    }

    fn finish_header_block(&mut self) -> Result<(), H2Error> {
        let Some(pending) = self.header_block.take() else {
            return Ok(());
        };
        // Decoded whatever happens next, to keep the HPACK table in sync.
        let max_list_size = self.local.max_header_list_size.map_or(usize::MAX, |max| max as usize);
        let fields = self
            .decoder
            .decode_bounded(&pending.fragments, max_list_size)
            .map_err(|_| H2Error::connection(ErrorCode::CompressionError, "HPACK decoding failed"))?;
        let id = pending.stream_id;

        match pending.disposition {
            Disposition::Discard => {
                tracing::trace!(stream_id = id, "Dropping headers on reset stream");
            }
            Disposition::Refuse => {
                record_refused_stream();
                tracing::debug!(stream_id = id, "Stream refused");
                self.queue(Frame::RstStream {
                    stream_id: id,
                    code: ErrorCode::RefusedStream,
                });
                self.remember_reset(id);
            }
            Disposition::Reset(code) => self.reset_stream(id, code),
            Disposition::Trailers => {
                if let Some(stream) = self.streams.get_mut(&id) {
                    stream.recv_end_stream();
                }
                self.emit_request(id);
            }
            Disposition::Open => self.open_stream(id, fields, pending.end_stream, pending.priority),
        }
        Ok(())
    }

    /// `fields` is `None` when the decoded list went over our
    /// SETTINGS_MAX_HEADER_LIST_SIZE.
    fn open_stream(&mut self, id: u32, fields: Option<Vec<HeaderField>>, end_stream: bool, priority: Option<PrioritySpec>) {
        let mut stream = Stream::new(id, self.remote.initial_window_size, self.local.initial_window_size);
        stream.open();
        if let Some(spec) = priority {
            stream.priority = spec;
        }
        if end_stream {
            stream.recv_end_stream();
        }
        self.last_processed = id;

        let parsed = match fields {
            Some(fields) => parse_request_head(fields, &self.limits),
            None => Err(HeadError::Limit(LimitViolation::HeadTooLarge)),
        };

        match parsed {
            Ok(head) => {
                stream.head_only = head.method == "HEAD";
                stream.head = Some(head);
                self.streams.insert(id, stream);
                if end_stream {
                    self.emit_request(id);
                }
            }
            Err(HeadError::Malformed(reason)) => {
                tracing::debug!(stream_id = id, reason, "Malformed request headers");
                self.queue(Frame::RstStream {
                    stream_id: id,
                    code: ErrorCode::ProtocolError,
                });
                self.remember_reset(id);
            }
            Err(HeadError::Limit(violation)) => {
                tracing::debug!(stream_id = id, violation = %violation, "Request rejected");
                self.streams.insert(id, stream);
                self.reject_stream(id, violation.status());
            }
        }
    }

    fn on_data(&mut self, id: u32, data: Bytes, end_stream: bool, flow_len: u32) -> Result<(), H2Error> {
        self.recv_window
            .consume(flow_len)
            .map_err(|_| H2Error::connection(ErrorCode::FlowControlError, "connection receive window exceeded"))?;
        if let Some(increment) = self.recv_window.release(flow_len) {
            self.queue(Frame::WindowUpdate { stream_id: 0, increment });
        }
        if id % 2 == 1 && id > self.last_client_stream {
            return Err(protocol("DATA on idle stream"));
        }
        if self.was_reset(id) {
            // Sent before the peer saw our RST_STREAM; only the connection
            // window counts it.
            return Ok(());
        }

        let max_body = self.limits.max_body_size();
        let Some(stream) = self.streams.get_mut(&id) else {
            return Err(H2Error::stream(id, ErrorCode::StreamClosed));
        };
        if !stream.can_receive() {
            return Err(H2Error::stream(id, ErrorCode::StreamClosed));
        }
        stream
            .recv_window
            .consume(flow_len)
            .map_err(|_| H2Error::stream(id, ErrorCode::FlowControlError))?;
        let update = if end_stream {
            None
        } else {
            stream.recv_window.release(flow_len)
        };

        let oversized = !stream.rejected && stream.body.len() + data.len() > max_body;
        if !stream.rejected && !oversized {
            stream.body.push(data);
        }
        if end_stream {
            stream.recv_end_stream();
        }
        let rejected = stream.rejected;

        if let Some(increment) = update {
            self.queue(Frame::WindowUpdate { stream_id: id, increment });
        }
        if oversized {
            tracing::debug!(stream_id = id, max_body, "Request body too large");
            self.reject_stream(id, LimitViolation::BodyTooLarge.status());
        } else if end_stream && !rejected {
            self.emit_request(id);
        }
        Ok(())
    }

    fn on_rst(&mut self, id: u32, code: ErrorCode) -> Result<(), H2Error> {
        let idle = if id % 2 == 1 {
            id > self.last_client_stream
        } else {
            id >= self.next_push_id
        };
        if idle {
            return Err(protocol("RST_STREAM on idle stream"));
        }
        tracing::debug!(stream_id = id, code = %code, "Stream reset by peer");
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.reset();
            self.events.push_back(H2Event::StreamReset { stream_id: id });
            self.remember_reset(id);
        }
        Ok(())
    }

    fn on_goaway(&mut self, last_stream_id: u32, code: ErrorCode) {
        tracing::debug!(last_stream_id, code = %code, "GOAWAY received");
        self.goaway_received = Some(last_stream_id);
        // Pushed streams above last_stream_id were not processed by the peer.
        let unprocessed: Vec<u32> = self
            .streams
            .iter()
            .filter(|(id, s)| *id % 2 == 0 && **id > last_stream_id && !s.is_done())
            .map(|(id, _)| *id)
            .collect();
        for id in unprocessed {
            if let Some(stream) = self.streams.get_mut(&id) {
                stream.reset();
                self.events.push_back(H2Event::StreamReset { stream_id: id });
            }
        }
    }

    fn on_settings(&mut self, ack: bool, values: &[(u16, u32)]) -> Result<(), H2Error> {
        if ack {
            return Ok(());
        }
        let next = self.remote.merged(values)?;

        let delta = i64::from(next.initial_window_size) - i64::from(self.remote.initial_window_size);
        if delta != 0 {
            for stream in self.streams.values_mut().filter(|s| s.is_active()) {
                stream.send_window.adjust(delta).map_err(|_| {
                    H2Error::connection(ErrorCode::FlowControlError, "INITIAL_WINDOW_SIZE overflows a stream window")
                })?;
            }
        }
        if next.header_table_size != self.remote.header_table_size {
            self.encoder
                .set_max_table_size(next.header_table_size.min(MAX_ENCODER_TABLE) as usize);
        }
        self.remote = next;
        self.queue(Frame::Settings {
            ack: true,
            values: Vec::new(),
        });
        if self.phase == Phase::Settings {
            self.phase = Phase::Open;
        }
        Ok(())
    }

    fn on_window_update(&mut self, id: u32, increment: u32) -> Result<(), H2Error> {
        if id == 0 {
            return self
                .send_window
                .increase(increment)
                .map_err(|_| H2Error::connection(ErrorCode::FlowControlError, "connection window overflow"));
        }
        if id % 2 == 1 && id > self.last_client_stream {
            return Err(protocol("WINDOW_UPDATE on idle stream"));
        }
        if let Some(stream) = self.streams.get_mut(&id) {
            stream
                .send_window
                .increase(increment)
                .map_err(|_| H2Error::connection(ErrorCode::FlowControlError, "stream window overflow"))?;
        }
        Ok(())
    }

    fn emit_request(&mut self, id: u32) {
        let Some(stream) = self.streams.get_mut(&id) else {
            return;
        };
        if stream.rejected {
            return;
        }
        let Some(head) = stream.head.clone() else {
            return;
        };
        let body = std::mem::take(&mut stream.body);
        self.events.push_back(H2Event::Request {
            stream_id: id,
            head,
            body,
        });
    }

    /// Answer a stream with a bare status without involving the application.
    fn reject_stream(&mut self, id: u32, status: u16) {
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.rejected = true;
            stream.body = Body::empty();
        }
        self.send_response(id, Response::status_only(status));
    }

    fn reset_stream(&mut self, id: u32, code: ErrorCode) {
        tracing::debug!(stream_id = id, code = %code, "Resetting stream");
        self.queue(Frame::RstStream { stream_id: id, code });
        if let Some(stream) = self.streams.get_mut(&id) {
            stream.reset();
            self.events.push_back(H2Event::StreamReset { stream_id: id });
        }
        self.remember_reset(id);
    }

    fn remember_reset(&mut self, id: u32) {
        if self.recently_reset.contains(&id) {
            return;
        }
        if self.recently_reset.len() == RESET_MEMORY {
            self.recently_reset.pop_front();
        }
        self.recently_reset.push_back(id);
    }

    fn was_reset(&self, id: u32) -> bool {
        self.recently_reset.contains(&id)
    }

    fn push_allowed(&self) -> bool {
        self.remote.enable_push && self.goaway_received.is_none() && self.goaway_sent.is_none()
    }

    fn promise(&mut self, stream_id: u32, origin: Option<&RequestHead>, paths: Vec<String>) -> Vec<PushRequest> {
        let scheme = origin.map_or_else(|| "https".to_string(), |h| h.scheme.clone());
        let authority = origin.and_then(|h| h.authority.clone());
        let push_limit = self.remote.max_concurrent_streams.unwrap_or(u32::MAX) as usize;
        let mut pushes = Vec::new();

        for path in paths {
            if !path.starts_with('/') {
                continue;
            }
            let pushed_active = self
                .streams
                .iter()
                .filter(|(id, s)| *id % 2 == 0 && s.is_active())
                .count();
            if self.next_push_id > MAX_STREAM_ID || pushed_active >= push_limit {
                break;
            }
            let promised_id = self.next_push_id;
            self.next_push_id += 2;

            let mut fields: Vec<(&[u8], &[u8])> = vec![
                (&b":method"[..], &b"GET"[..]),
                (&b":scheme"[..], scheme.as_bytes()),
                (&b":path"[..], path.as_bytes()),
            ];
            if let Some(authority) = &authority {
                fields.push((&b":authority"[..], authority.as_bytes()));
            }
            let mut block = Vec::new();
            self.encoder.encode(fields, &mut block);
            self.queue_push_promise(stream_id, promised_id, Bytes::from(block));

            let mut headers = Headers::new();
            if let Some(authority) = &authority {
                headers.append("host", authority.clone());
            }
            let head = RequestHead {
                method: "GET".to_string(),
                scheme: scheme.clone(),
                authority: authority.clone(),
                path,
                headers,
            };
            let mut stream = Stream::new(promised_id, self.remote.initial_window_size, self.local.initial_window_size);
            stream.open();
            stream.recv_end_stream();
            stream.head = Some(head.clone());
            self.streams.insert(promised_id, stream);
            tracing::debug!(stream_id, promised_id, path = %head.path, "Push promised");
            pushes.push(PushRequest { promised_id, head });
        }
        pushes
    }

    /// HEADERS followed by as many CONTINUATION frames as the peer's
    /// max frame size requires.
    fn queue_headers(&mut self, stream_id: u32, mut block: Bytes, end_stream: bool) {
        let max = self.remote.max_frame_size as usize;
        let first = block.split_to(block.len().min(max));
        self.queue(Frame::Headers {
            stream_id,
            block: first,
            end_stream,
            end_headers: block.is_empty(),
            priority: None,
        });
        self.queue_continuations(stream_id, block);
    }

    fn queue_push_promise(&mut self, stream_id: u32, promised_id: u32, mut block: Bytes) {
        let max = self.remote.max_frame_size as usize - 4;
        let first = block.split_to(block.len().min(max));
        self.queue(Frame::PushPromise {
            stream_id,
            promised_id,
            block: first,
            end_headers: block.is_empty(),
        });
        self.queue_continuations(stream_id, block);
    }

    fn queue_continuations(&mut self, stream_id: u32, mut rest: Bytes) {
        let max = self.remote.max_frame_size as usize;
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            self.queue(Frame::Continuation {
                stream_id,
                block: chunk,
                end_headers: rest.is_empty(),
            });
        }
    }

    fn fail(&mut self, code: ErrorCode, reason: &'static str) {
        tracing::warn!(code = %code, reason, last_stream_id = self.last_processed, "HTTP/2 connection error");
        self.queue(Frame::GoAway {
            last_stream_id: self.last_processed,
            code,
            debug: Bytes::from_static(reason.as_bytes()),
        });
        self.goaway_sent = Some(self.last_processed);
        self.phase = Phase::Closed;
        for stream in self.streams.values_mut() {
            stream.reset();
        }
        self.streams.clear();
    }

    fn collect_closed(&mut self) {
        self.streams.retain(|_, s| !s.is_done());
    }

    fn queue(&mut self, frame: Frame) {
        frame.encode(&mut self.out);
    }
}

fn protocol(reason: &'static str) -> H2Error {
    H2Error::connection(ErrorCode::ProtocolError, reason)
}

/// Validate pseudo-headers and regular fields and build the request head.
fn parse_request_head(fields: Vec<HeaderField>, limits: &RequestLimits) -> Result<RequestHead, HeadError> {
    let mut method = None;
    let mut scheme = None;
    let mut authority = None;
    let mut path = None;
    let mut headers = Headers::with_capacity(fields.len());
    let mut cookies = Vec::new();
    let mut seen_regular = false;

    for field in fields {
        let name = String::from_utf8(field.name).map_err(|_| HeadError::Malformed("non-UTF-8 header name"))?;
        let value = String::from_utf8(field.value).map_err(|_| HeadError::Malformed("non-UTF-8 header value"))?;

        if let Some(pseudo) = name.strip_prefix(':') {
            if seen_regular {
                return Err(HeadError::Malformed("pseudo-header after regular header"));
            }
            let slot = match pseudo {
                "method" => &mut method,
                "scheme" => &mut scheme,
                "authority" => &mut authority,
                "path" => &mut path,
                _ => return Err(HeadError::Malformed("unknown pseudo-header")),
            };
            if slot.replace(value).is_some() {
                return Err(HeadError::Malformed("duplicate pseudo-header"));
            }
            continue;
        }

        seen_regular = true;
        if name.bytes().any(|b| b.is_ascii_uppercase()) {
            return Err(HeadError::Malformed("uppercase header name"));
        }
        if CONNECTION_SPECIFIC.contains(&name.as_str()) {
            return Err(HeadError::Malformed("connection-specific header"));
        }
        if name == "te" && !value.eq_ignore_ascii_case("trailers") {
            return Err(HeadError::Malformed("TE other than trailers"));
        }
        limits
            .check_header(name.as_bytes(), value.as_bytes())
            .map_err(HeadError::Limit)?;
        if name == "cookie" {
            cookies.push(value);
        } else {
            headers.append(name, value);
        }
    }
    if !cookies.is_empty() {
        headers.append("cookie", cookies.join("; "));
    }
    limits.check_header_count(headers.len()).map_err(HeadError::Limit)?;

    let method = method.ok_or(HeadError::Malformed("missing :method"))?;
    limits.check_method(&method).map_err(HeadError::Limit)?;
    let scheme = scheme.ok_or(HeadError::Malformed("missing :scheme"))?;
    let path = path
        .filter(|p| !p.is_empty())
        .ok_or(HeadError::Malformed("missing :path"))?;
    let (target_path, query) = split_target(&path);
    limits
        .check_target(&method, &target_path, query.as_deref())
        .map_err(HeadError::Limit)?;

    if let Some(authority) = &authority {
        if !headers.contains("host") {
            headers.append("host", authority.clone());
        }
    }
    Ok(RequestHead {
        method,
        scheme,
        authority,
        path,
        headers,
    })
}
