//! HTTP/2 framing (RFC 7540 Section 4 and 6).
//!
//! # Wire Layout
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                   |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+-------------------------------+
//! |R|                 Stream Identifier (31)                      |
//! +=+=============================================================+
//! |                   Frame Payload (0...)                      ...
//! +---------------------------------------------------------------+
//! ```
//!
//! # Design Decisions
//! - Decoding works on a `BytesMut` read buffer and splits payloads off
//!   without copying
//! - Frame-size violations are detected from the header alone, before the
//!   payload is buffered
//! - Malformed PRIORITY frames decode to `priority: None` and are ignored

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{ErrorCode, H2Error};

pub const FRAME_HEADER_LEN: usize = 9;

/// Client connection preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";

pub const TYPE_DATA: u8 = 0x0;
pub const TYPE_HEADERS: u8 = 0x1;
pub const TYPE_PRIORITY: u8 = 0x2;
pub const TYPE_RST_STREAM: u8 = 0x3;
pub const TYPE_SETTINGS: u8 = 0x4;
pub const TYPE_PUSH_PROMISE: u8 = 0x5;
pub const TYPE_PING: u8 = 0x6;
pub const TYPE_GOAWAY: u8 = 0x7;
pub const TYPE_WINDOW_UPDATE: u8 = 0x8;
pub const TYPE_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

const STREAM_ID_MASK: u32 = 0x7fff_ffff;

/// Stream dependency and weight carried by HEADERS and PRIORITY.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrioritySpec {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        data: Bytes,
        end_stream: bool,
        /// Full payload length including padding; this is what flow
        /// control accounts for.
        flow_len: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<PrioritySpec>,
    },
    Priority {
        stream_id: u32,
        priority: Option<PrioritySpec>,
    },
    RstStream {
        stream_id: u32,
        code: ErrorCode,
    },
    Settings {
        ack: bool,
        values: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        payload: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        code: ErrorCode,
        debug: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Unknown {
        kind: u8,
        stream_id: u32,
    },
}

fn put_header<B: BufMut>(out: &mut B, len: usize, kind: u8, flags: u8, stream_id: u32) {
    out.put_uint(len as u64, 3);
    out.put_u8(kind);
    out.put_u8(flags);
    out.put_u32(stream_id & STREAM_ID_MASK);
}

fn put_priority<B: BufMut>(out: &mut B, spec: &PrioritySpec) {
    let dep = if spec.exclusive {
        spec.dependency | 0x8000_0000
    } else {
        spec.dependency
    };
    out.put_u32(dep);
    out.put_u8(spec.weight);
}

fn read_priority(mut raw: &[u8]) -> PrioritySpec {
    let dep = raw.get_u32();
    PrioritySpec {
        exclusive: dep & 0x8000_0000 != 0,
        dependency: dep & STREAM_ID_MASK,
        weight: raw.get_u8(),
    }
}

impl Frame {
    pub fn stream_id(&self) -> u32 {
        match self {
            Frame::Data { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::Priority { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::PushPromise { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Continuation { stream_id, .. }
            | Frame::Unknown { stream_id, .. } => *stream_id,
            Frame::Settings { .. } | Frame::Ping { .. } | Frame::GoAway { .. } => 0,
        }
    }

    /// Serializes the frame. Padding is never emitted.
    pub fn encode<B: BufMut>(&self, out: &mut B) {
        match self {
            Frame::Data { stream_id, data, end_stream, .. } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                put_header(out, data.len(), TYPE_DATA, flags, *stream_id);
                out.put_slice(data);
            }
            Frame::Headers { stream_id, block, end_stream, end_headers, priority } => {
                let mut flags = 0;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                match priority {
                    Some(spec) => {
                        put_header(out, block.len() + 5, TYPE_HEADERS, flags | FLAG_PRIORITY, *stream_id);
                        put_priority(out, spec);
                    }
                    None => put_header(out, block.len(), TYPE_HEADERS, flags, *stream_id),
                }
                out.put_slice(block);
            }
            Frame::Priority { stream_id, priority } => {
                if let Some(spec) = priority {
                    put_header(out, 5, TYPE_PRIORITY, 0, *stream_id);
                    put_priority(out, spec);
                }
            }
            Frame::RstStream { stream_id, code } => {
                put_header(out, 4, TYPE_RST_STREAM, 0, *stream_id);
                out.put_u32(*code as u32);
            }
            Frame::Settings { ack, values } => {
                if *ack {
                    put_header(out, 0, TYPE_SETTINGS, FLAG_ACK, 0);
                } else {
                    put_header(out, values.len() * 6, TYPE_SETTINGS, 0, 0);
                    for (id, value) in values {
                        out.put_u16(*id);
                        out.put_u32(*value);
                    }
                }
            }
            Frame::PushPromise { stream_id, promised_id, block, end_headers } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_header(out, block.len() + 4, TYPE_PUSH_PROMISE, flags, *stream_id);
                out.put_u32(*promised_id & STREAM_ID_MASK);
                out.put_slice(block);
            }
            Frame::Ping { ack, payload } => {
                put_header(out, 8, TYPE_PING, if *ack { FLAG_ACK } else { 0 }, 0);
                out.put_slice(payload);
            }
            Frame::GoAway { last_stream_id, code, debug } => {
                put_header(out, 8 + debug.len(), TYPE_GOAWAY, 0, 0);
                out.put_u32(*last_stream_id & STREAM_ID_MASK);
                out.put_u32(*code as u32);
                out.put_slice(debug);
            }
            Frame::WindowUpdate { stream_id, increment } => {
                put_header(out, 4, TYPE_WINDOW_UPDATE, 0, *stream_id);
                out.put_u32(*increment & STREAM_ID_MASK);
            }
            Frame::Continuation { stream_id, block, end_headers } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                put_header(out, block.len(), TYPE_CONTINUATION, flags, *stream_id);
                out.put_slice(block);
            }
            Frame::Unknown { .. } => {}
        }
    }
}

fn protocol(reason: &'static str) -> H2Error {
    H2Error::connection(ErrorCode::ProtocolError, reason)
}

fn frame_size(reason: &'static str) -> H2Error {
    H2Error::connection(ErrorCode::FrameSizeError, reason)
}

fn strip_padding(mut payload: Bytes, flags: u8) -> Result<Bytes, H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(frame_size("padded frame without pad length"));
    }
    let pad = payload.get_u8() as usize;
    if pad > payload.len() {
        return Err(protocol("padding exceeds payload"));
    }
    payload.truncate(payload.len() - pad);
    Ok(payload)
}

/// Decodes one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` when more bytes are needed.
pub fn decode(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, H2Error> {
    if buf.len() < FRAME_HEADER_LEN {
        return Ok(None);
    }
    let len = (usize::from(buf[0]) << 16) | (usize::from(buf[1]) << 8) | usize::from(buf[2]);
    if len > max_frame_size as usize {
        return Err(frame_size("frame exceeds SETTINGS_MAX_FRAME_SIZE"));
    }
    if buf.len() < FRAME_HEADER_LEN + len {
        return Ok(None);
    }

    let mut head = buf.split_to(FRAME_HEADER_LEN);
    let payload = buf.split_to(len).freeze();
    head.advance(3);
    let kind = head.get_u8();
    let flags = head.get_u8();
    let stream_id = head.get_u32() & STREAM_ID_MASK;

    let needs_stream = matches!(
        kind,
        TYPE_DATA | TYPE_HEADERS | TYPE_PRIORITY | TYPE_RST_STREAM | TYPE_PUSH_PROMISE | TYPE_CONTINUATION
    );
    if needs_stream && stream_id == 0 {
        return Err(protocol("stream frame on stream 0"));
    }
    if matches!(kind, TYPE_SETTINGS | TYPE_PING | TYPE_GOAWAY) && stream_id != 0 {
        return Err(protocol("connection frame on a stream"));
    }

    let frame = match kind {
        TYPE_DATA => {
            let data = strip_padding(payload, flags)?;
            Frame::Data {
                stream_id,
                data,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_len: len as u32,
            }
        }
        TYPE_HEADERS => {
            let mut block = strip_padding(payload, flags)?;
            let mut priority = None;
            if flags & FLAG_PRIORITY != 0 {
                if block.len() < 5 {
                    return Err(frame_size("HEADERS priority truncated"));
                }
                let spec = read_priority(&block.split_to(5));
                priority = (spec.dependency != stream_id).then_some(spec);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        TYPE_PRIORITY => {
            let priority = (payload.len() == 5)
                .then(|| read_priority(&payload))
                .filter(|spec| spec.dependency != stream_id);
            Frame::Priority { stream_id, priority }
        }
        TYPE_RST_STREAM => {
            if payload.len() != 4 {
                return Err(frame_size("RST_STREAM length"));
            }
            Frame::RstStream {
                stream_id,
                code: ErrorCode::from_u32((&payload[..]).get_u32()),
            }
        }
        TYPE_SETTINGS => {
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(frame_size("SETTINGS ack with payload"));
            }
            if payload.len() % 6 != 0 {
                return Err(frame_size("SETTINGS length"));
            }
            let values = payload
                .chunks_exact(6)
                .map(|mut entry| (entry.get_u16(), entry.get_u32()))
                .collect();
            Frame::Settings { ack, values }
        }
        TYPE_PUSH_PROMISE => {
            let mut block = strip_padding(payload, flags)?;
            if block.len() < 4 {
                return Err(frame_size("PUSH_PROMISE truncated"));
            }
            let promised_id = block.get_u32() & STREAM_ID_MASK;
            Frame::PushPromise {
                stream_id,
                promised_id,
                block,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        TYPE_PING => {
            let payload: [u8; 8] = payload[..]
                .try_into()
                .map_err(|_| frame_size("PING length"))?;
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                payload,
            }
        }
        TYPE_GOAWAY => {
            let mut payload = payload;
            if payload.len() < 8 {
                return Err(frame_size("GOAWAY truncated"));
            }
            let last_stream_id = payload.get_u32() & STREAM_ID_MASK;
            let code = ErrorCode::from_u32(payload.get_u32());
            Frame::GoAway {
                last_stream_id,
                code,
                debug: payload,
            }
        }
        TYPE_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(frame_size("WINDOW_UPDATE length"));
            }
            let increment = (&payload[..]).get_u32() & STREAM_ID_MASK;
            if increment == 0 {
                return Err(if stream_id == 0 {
                    protocol("zero WINDOW_UPDATE increment")
                } else {
                    H2Error::stream(stream_id, ErrorCode::ProtocolError)
                });
            }
            Frame::WindowUpdate { stream_id, increment }
        }
        TYPE_CONTINUATION => Frame::Continuation {
            stream_id,
            block: payload,
            end_headers: flags & FLAG_END_HEADERS != 0,
        },
        _ => Frame::Unknown { kind, stream_id },
    };
    Ok(Some(frame))
}
