//! HTTP/2 with prior knowledge over plaintext sockets.

mod common;

use std::time::Duration;

use bytes::Bytes;
use http_engine::http2::error::ErrorCode;
use http_engine::http2::frame::Frame;
use http_engine::http2::settings::{ENABLE_PUSH, MAX_CONCURRENT_STREAMS};

use common::{test_config, H2Client, TestServer};

#[tokio::test]
async fn streams_are_multiplexed_on_one_connection() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, Vec::new()).await;
    assert!(client
        .server_settings
        .iter()
        .any(|&(id, value)| id == MAX_CONCURRENT_STREAMS && value == 100));

    client.request(1, "GET", "/one", None).await;
    client.request(3, "POST", "/two", Some(b"payload")).await;
    client.request(5, "GET", "/three?x=1", None).await;

    let responses = client.collect(&[1, 3, 5]).await;
    let ids: Vec<u32> = responses.iter().map(|(id, _)| *id).collect();
    assert_eq!(ids, vec![1, 3, 5]);

    assert_eq!(&responses[0].1.body[..], b"GET /one HTTP/2\n");
    assert_eq!(&responses[1].1.body[..], b"POST /two HTTP/2\npayload");
    assert_eq!(&responses[2].1.body[..], b"GET /three?x=1 HTTP/2\n");
    for (_, response) in &responses {
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("content-type"), Some("text/plain"));
    }
    server.stop().await;
}

#[tokio::test]
async fn server_push_follows_the_promise() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, Vec::new()).await;

    client.request(1, "GET", "/page?push=/style.css", None).await;
    let responses = client.collect(&[1]).await;
    assert_eq!(responses.len(), 2);

    let (page_id, page) = &responses[0];
    assert_eq!(*page_id, 1);
    assert_eq!(page.status(), 200);

    let (pushed_id, pushed) = &responses[1];
    assert_eq!(*pushed_id, 2);
    assert_eq!(pushed.header("promise:path"), Some("/style.css"));
    assert_eq!(pushed.header("promise:method"), Some("GET"));
    assert_eq!(pushed.status(), 200);
    assert!(pushed.body.starts_with(b"GET /style.css "));
    server.stop().await;
}

#[tokio::test]
async fn push_disabled_by_client_is_not_sent() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, vec![(ENABLE_PUSH, 0)]).await;

    client.request(1, "GET", "/page?push=/style.css", None).await;
    let responses = client.collect(&[1]).await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0, 1);
    server.stop().await;
}

#[tokio::test]
async fn ping_is_acknowledged() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, Vec::new()).await;
    client
        .send(Frame::Ping {
            ack: false,
            payload: *b"12345678",
        })
        .await;

    loop {
        match client.read_frame().await {
            Some(Frame::Ping { ack: true, payload }) => {
                assert_eq!(&payload, b"12345678");
                break;
            }
            Some(_) => continue,
            None => panic!("connection closed before PING ack"),
        }
    }
    server.stop().await;
}

#[tokio::test]
async fn shutdown_sends_goaway() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, Vec::new()).await;
    client.request(1, "GET", "/", None).await;
    client.collect(&[1]).await;

    server.shutdown.trigger();
    let mut saw_goaway = false;
    while let Some(frame) = client.read_frame().await {
        if let Frame::GoAway { last_stream_id, .. } = frame {
            assert_eq!(last_stream_id, 1);
            saw_goaway = true;
        }
    }
    assert!(saw_goaway);
    server.stop().await;
}

#[tokio::test]
async fn peer_goaway_closes_once_streams_finish() {
    let server = TestServer::start(test_config()).await;
    let mut client = H2Client::handshake(server.connect().await, Vec::new()).await;
    client.request(1, "GET", "/last", None).await;
    client
        .send(Frame::GoAway {
            last_stream_id: 0,
            code: ErrorCode::NoError,
            debug: Bytes::new(),
        })
        .await;

    let responses = client.collect(&[1]).await;
    assert_eq!(&responses[0].1.body[..], b"GET /last HTTP/2\n");

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        while client.read_frame().await.is_some() {}
    })
    .await;
    assert!(closed.is_ok(), "connection stayed open after GOAWAY");
    server.stop().await;
}
