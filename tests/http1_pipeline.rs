//! HTTP/1.1 behaviour over real sockets.

mod common;

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;

use common::{closed_within, read_response, test_config, H2Client, TestServer};

#[tokio::test]
async fn pipelined_requests_answer_in_order_then_idle_close() {
    let mut config = test_config();
    config.http1.idle_timeout_secs = 1;
    let server = TestServer::start(config).await;

    let mut stream = server.connect().await;
    stream
        .write_all(
            b"GET /first HTTP/1.1\r\nHost: test\r\n\r\n\
              GET /second HTTP/1.1\r\nHost: test\r\n\r\n\
              GET /third HTTP/1.1\r\nHost: test\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    for path in ["/first", "/second", "/third"] {
        let response = read_response(&mut stream, &mut buf).await;
        assert_eq!(response.status, 200);
        assert_eq!(response.body_str(), format!("GET {path} HTTP/1.1\n"));
        assert_ne!(response.header("connection"), Some("close"));
    }
    assert!(buf.is_empty());

    assert!(closed_within(&mut stream, Duration::from_secs(4)).await);
    server.stop().await;
}

#[tokio::test]
async fn chunked_upload_is_echoed() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream
        .write_all(
            b"POST /upload HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.body_str(), "POST /upload HTTP/1.1\nhello world");
    assert_eq!(response.header("content-type"), Some("text/plain"));
    server.stop().await;
}

#[tokio::test]
async fn connection_close_is_honoured() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream
        .write_all(b"GET / HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 200);
    assert_eq!(response.header("connection"), Some("close"));
    assert!(closed_within(&mut stream, Duration::from_secs(2)).await);
    server.stop().await;
}

#[tokio::test]
async fn malformed_request_gets_400_and_close() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

    let mut buf = BytesMut::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 400);
    assert!(closed_within(&mut stream, Duration::from_secs(2)).await);
    server.stop().await;
}

#[tokio::test]
async fn traversal_is_rejected() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream
        .write_all(b"GET /static/../../etc/passwd HTTP/1.1\r\nHost: test\r\n\r\n")
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let response = read_response(&mut stream, &mut buf).await;
    assert_eq!(response.status, 400);
    server.stop().await;
}

#[tokio::test]
async fn h2c_upgrade_answers_first_request_on_stream_one() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream
        .write_all(
            b"GET /upgraded HTTP/1.1\r\nHost: test\r\n\
              Connection: Upgrade, HTTP2-Settings\r\nUpgrade: h2c\r\n\
              HTTP2-Settings: AAMAAABk\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = BytesMut::new();
    let switching = read_response(&mut stream, &mut buf).await;
    assert_eq!(switching.status, 101);
    assert_eq!(switching.header("upgrade"), Some("h2c"));

    let mut client = H2Client::handshake_buffered(stream, buf, Vec::new()).await;
    let responses = client.collect(&[1]).await;
    assert_eq!(responses.len(), 1);
    let (stream_id, response) = &responses[0];
    assert_eq!(*stream_id, 1);
    assert_eq!(response.status(), 200);
    assert!(response.body.starts_with(b"GET /upgraded "));

    // The connection carries further streams as plain HTTP/2.
    client.request(3, "GET", "/next", None).await;
    let responses = client.collect(&[3]).await;
    assert!(responses[0].1.body.starts_with(b"GET /next "));
    server.stop().await;
}

#[tokio::test]
async fn shutdown_drains_idle_keepalive_connections() {
    let server = TestServer::start(test_config()).await;
    let mut stream = server.connect().await;
    stream.write_all(b"GET / HTTP/1.1\r\nHost: test\r\n\r\n").await.unwrap();
    let mut buf = BytesMut::new();
    assert_eq!(read_response(&mut stream, &mut buf).await.status, 200);

    server.shutdown.trigger();
    assert!(closed_within(&mut stream, Duration::from_secs(3)).await);
    server.stop().await;
}
