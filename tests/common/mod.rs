//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;

use http_engine::app::{Application, Echo};
use http_engine::config::ServerConfig;
use http_engine::http2::frame::{self, Frame, PREFACE};
use http_engine::http2::hpack::{Decoder, Encoder};
use http_engine::{EngineError, Server, Shutdown};

pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Loopback, ephemeral port, one worker.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listener.host = "127.0.0.1".to_string();
    config.listener.port = 0;
    config.listener.workers = 1;
    config.listener.reuse_port = false;
    config.shutdown.grace_period_secs = 1;
    config
}

/// An in-process server running on the test runtime.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<Result<(), EngineError>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig) -> Self {
        Self::start_with(config, Arc::new(Echo)).await
    }

    pub async fn start_with(config: ServerConfig, app: Arc<dyn Application>) -> Self {
        let server = Server::bind(config, app).await.expect("bind test server");
        let addr = server.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let handle = tokio::spawn(server.run(shutdown.subscribe()));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("server did not stop")
            .expect("server task panicked")
            .expect("server returned an error");
    }

    pub async fn connect(&self) -> TcpStream {
        TcpStream::connect(self.addr).await.unwrap()
    }

    /// Connect from another loopback address so the server sees a
    /// different peer IP.
    pub async fn connect_from(&self, source: &str) -> TcpStream {
        let socket = TcpSocket::new_v4().unwrap();
        socket.bind(format!("{source}:0").parse().unwrap()).unwrap();
        socket.connect(self.addr).await.unwrap()
    }
}

/// A parsed HTTP/1.1 response.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap()
    }
}

async fn fill<S: AsyncRead + Unpin>(io: &mut S, buf: &mut BytesMut) -> usize {
    tokio::time::timeout(IO_TIMEOUT, io.read_buf(buf))
        .await
        .expect("read timed out")
        .unwrap()
}

/// Read one response. Bytes past it stay in `buf` for the next call.
pub async fn read_response<S: AsyncRead + Unpin>(io: &mut S, buf: &mut BytesMut) -> RawResponse {
    let (status, headers, head_len) = loop {
        let mut slots = [httparse::EMPTY_HEADER; 64];
        let mut parsed = httparse::Response::new(&mut slots);
        if let httparse::Status::Complete(len) = parsed.parse(&buf[..]).unwrap() {
            let headers: Vec<(String, String)> = parsed
                .headers
                .iter()
                .map(|h| (h.name.to_string(), String::from_utf8_lossy(h.value).into_owned()))
                .collect();
            break (parsed.code.unwrap(), headers, len);
        }
        assert!(fill(io, buf).await > 0, "connection closed mid-head");
    };
    buf.advance(head_len);

    let find = |name: &str| {
        headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let body = if find("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        read_chunked(io, buf).await
    } else if let Some(len) = find("content-length") {
        let len: usize = len.parse().unwrap();
        while buf.len() < len {
            assert!(fill(io, buf).await > 0, "connection closed mid-body");
        }
        buf.split_to(len).freeze()
    } else {
        Bytes::new()
    };

    RawResponse {
        status,
        headers,
        body,
    }
}

async fn read_chunked<S: AsyncRead + Unpin>(io: &mut S, buf: &mut BytesMut) -> Bytes {
    let mut body = BytesMut::new();
    loop {
        let line_end = loop {
            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                break pos;
            }
            assert!(fill(io, buf).await > 0, "connection closed mid-chunk");
        };
        let size_line = std::str::from_utf8(&buf[..line_end]).unwrap().to_string();
        let size = usize::from_str_radix(size_line.split(';').next().unwrap().trim(), 16).unwrap();
        buf.advance(line_end + 2);
        while buf.len() < size + 2 {
            assert!(fill(io, buf).await > 0, "connection closed mid-chunk");
        }
        body.extend_from_slice(&buf[..size]);
        buf.advance(size + 2);
        if size == 0 {
            return body.freeze();
        }
    }
}

/// True once the peer has closed: the next read returns EOF or a reset.
pub async fn closed_within<S: AsyncRead + Unpin>(io: &mut S, limit: Duration) -> bool {
    let mut scratch = [0u8; 256];
    match tokio::time::timeout(limit, io.read(&mut scratch)).await {
        Ok(Ok(0)) | Ok(Err(_)) => true,
        Ok(Ok(_)) | Err(_) => false,
    }
}

/// A minimal HTTP/2 client over the crate's own frame and HPACK codecs.
pub struct H2Client<S> {
    io: S,
    buf: BytesMut,
    encoder: Encoder,
    decoder: Decoder,
    pub server_settings: Vec<(u16, u32)>,
}

/// A response collected from one stream.
#[derive(Debug, Default)]
pub struct H2Response {
    pub headers: Vec<(String, String)>,
    pub body: BytesMut,
}

impl H2Response {
    pub fn status(&self) -> u16 {
        self.header(":status").unwrap().parse().unwrap()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> H2Client<S> {
    /// Send the preface and `settings`, wait for the server's SETTINGS and
    /// acknowledge it.
    pub async fn handshake(io: S, settings: Vec<(u16, u32)>) -> Self {
        Self::handshake_buffered(io, BytesMut::new(), settings).await
    }

    /// Like [`H2Client::handshake`], for a connection that already has
    /// server bytes buffered (after an h2c upgrade).
    pub async fn handshake_buffered(io: S, buf: BytesMut, settings: Vec<(u16, u32)>) -> Self {
        let mut client = Self {
            io,
            buf,
            encoder: Encoder::new(4096),
            decoder: Decoder::new(4096),
            server_settings: Vec::new(),
        };
        let mut out = BytesMut::new();
        out.put_slice(PREFACE);
        Frame::Settings {
            ack: false,
            values: settings,
        }
        .encode(&mut out);
        client.write(&out).await;

        match client.read_frame().await {
            Some(Frame::Settings { ack: false, values }) => client.server_settings = values,
            other => panic!("expected server SETTINGS, got {other:?}"),
        }
        client.send(Frame::Settings { ack: true, values: Vec::new() }).await;
        client
    }

    pub async fn write(&mut self, bytes: &[u8]) {
        self.io.write_all(bytes).await.unwrap();
        self.io.flush().await.unwrap();
    }

    pub async fn send(&mut self, frame: Frame) {
        let mut out = BytesMut::new();
        frame.encode(&mut out);
        self.write(&out).await;
    }

    /// Next frame, or `None` once the server has closed.
    pub async fn read_frame(&mut self) -> Option<Frame> {
        loop {
            if let Some(frame) = frame::decode(&mut self.buf, 1 << 24).unwrap() {
                return Some(frame);
            }
            let n = tokio::time::timeout(IO_TIMEOUT, self.io.read_buf(&mut self.buf))
                .await
                .expect("read timed out")
                .unwrap_or(0);
            if n == 0 {
                return None;
            }
        }
    }

    /// Send a request with an optional body on `stream_id`.
    pub async fn request(&mut self, stream_id: u32, method: &str, path: &str, body: Option<&[u8]>) {
        let fields = [
            (&b":method"[..], method.as_bytes()),
            (&b":scheme"[..], &b"http"[..]),
            (&b":path"[..], path.as_bytes()),
            (&b":authority"[..], &b"localhost"[..]),
        ];
        let mut block = Vec::new();
        self.encoder.encode(fields, &mut block);
        self.send(Frame::Headers {
            stream_id,
            block: Bytes::from(block),
            end_stream: body.is_none(),
            end_headers: true,
            priority: None,
        })
        .await;
        if let Some(body) = body {
            self.send(Frame::Data {
                stream_id,
                data: Bytes::copy_from_slice(body),
                end_stream: true,
                flow_len: body.len() as u32,
            })
            .await;
        }
    }

    /// Collect responses until every stream in `streams` has ended.
    /// PUSH_PROMISE frames add their promised stream to the wait set.
    pub async fn collect(&mut self, streams: &[u32]) -> Vec<(u32, H2Response)> {
        let mut pending: Vec<u32> = streams.to_vec();
        let mut done: Vec<(u32, H2Response)> = Vec::new();
        let mut open: Vec<(u32, H2Response)> = Vec::new();

        while !pending.is_empty() {
            let frame = self.read_frame().await.expect("server closed the connection");
            match frame {
                Frame::Headers {
                    stream_id,
                    block,
                    end_stream,
                    ..
                } => {
                    let fields = self.decoder.decode(&block).unwrap();
                    let entry = entry(&mut open, stream_id);
                    entry.headers.extend(fields.into_iter().map(|f| {
                        (
                            String::from_utf8(f.name).unwrap(),
                            String::from_utf8(f.value).unwrap(),
                        )
                    }));
                    if end_stream {
                        finish(&mut open, &mut pending, &mut done, stream_id);
                    }
                }
                Frame::Data {
                    stream_id,
                    data,
                    end_stream,
                    flow_len,
                } => {
                    entry(&mut open, stream_id).body.extend_from_slice(&data);
                    if flow_len > 0 {
                        self.send(Frame::WindowUpdate { stream_id: 0, increment: flow_len }).await;
                        if !end_stream {
                            self.send(Frame::WindowUpdate { stream_id, increment: flow_len }).await;
                        }
                    }
                    if end_stream {
                        finish(&mut open, &mut pending, &mut done, stream_id);
                    }
                }
                Frame::PushPromise { promised_id, block, .. } => {
                    let fields = self.decoder.decode(&block).unwrap();
                    let entry = entry(&mut open, promised_id);
                    entry.headers.extend(fields.into_iter().map(|f| {
                        (
                            format!("promise{}", String::from_utf8(f.name).unwrap()),
                            String::from_utf8(f.value).unwrap(),
                        )
                    }));
                    pending.push(promised_id);
                }
                Frame::Ping { ack: false, payload } => {
                    self.send(Frame::Ping { ack: true, payload }).await;
                }
                Frame::RstStream { stream_id, code } => {
                    panic!("stream {stream_id} reset: {code:?}");
                }
                Frame::GoAway { code, debug, .. } => {
                    panic!("GOAWAY {code:?}: {}", String::from_utf8_lossy(&debug));
                }
                _ => {}
            }
        }
        done.sort_by_key(|(id, _)| *id);
        done
    }

    pub fn into_inner(self) -> S {
        self.io
    }
}

fn entry(open: &mut Vec<(u32, H2Response)>, stream_id: u32) -> &mut H2Response {
    let index = match open.iter().position(|(id, _)| *id == stream_id) {
        Some(index) => index,
        None => {
            open.push((stream_id, H2Response::default()));
            open.len() - 1
        }
    };
    &mut open[index].1
}

fn finish(
    open: &mut Vec<(u32, H2Response)>,
    pending: &mut Vec<u32>,
    done: &mut Vec<(u32, H2Response)>,
    stream_id: u32,
) {
    if let Some(index) = open.iter().position(|(id, _)| *id == stream_id) {
        done.push(open.remove(index));
    }
    pending.retain(|id| *id != stream_id);
}
