//! Connection and request admission: rate limiting, IP filtering, CORS.

mod common;

use std::time::Duration;

use bytes::BytesMut;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use common::{closed_within, read_response, test_config, RawResponse, TestServer};
use http_engine::config::{CorsMismatch, MatchPolicy};

async fn get(stream: &mut TcpStream, buf: &mut BytesMut, path: &str) -> RawResponse {
    let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    read_response(stream, buf).await
}

#[tokio::test]
async fn rate_limited_client_gets_429_while_others_succeed() {
    let mut config = test_config();
    config.rate_limit.enabled = true;
    config.rate_limit.rate = 0.001;
    config.rate_limit.burst = 2.0;
    let server = TestServer::start(config).await;

    // Connection admission takes the first token, the second request the last one.
    let mut noisy = server.connect_from("127.0.0.1").await;
    let mut buf = BytesMut::new();
    assert_eq!(get(&mut noisy, &mut buf, "/1").await.status, 200);
    assert_eq!(get(&mut noisy, &mut buf, "/2").await.status, 200);
    let limited = get(&mut noisy, &mut buf, "/3").await;
    assert_eq!(limited.status, 429);
    assert_eq!(limited.body_str(), "Too Many Requests");

    // Another client on the same process is unaffected.
    let mut quiet = server.connect_from("127.0.0.2").await;
    let mut quiet_buf = BytesMut::new();
    let ok = get(&mut quiet, &mut quiet_buf, "/hello").await;
    assert_eq!(ok.status, 200);
    assert_eq!(ok.body_str(), "GET /hello HTTP/1.1\n");

    // A fresh connection from the limited client is turned away at accept.
    let mut again = server.connect_from("127.0.0.1").await;
    let mut again_buf = BytesMut::new();
    let rejected = read_response(&mut again, &mut again_buf).await;
    assert_eq!(rejected.status, 429);
    assert!(closed_within(&mut again, Duration::from_secs(2)).await);

    server.stop().await;
}

#[tokio::test]
async fn denied_peer_gets_403_and_close() {
    let mut config = test_config();
    config.ip_filter.deny = vec!["127.0.0.2/32".to_string()];
    let server = TestServer::start(config).await;

    let mut denied = server.connect_from("127.0.0.2").await;
    let mut buf = BytesMut::new();
    let response = read_response(&mut denied, &mut buf).await;
    assert_eq!(response.status, 403);
    assert!(closed_within(&mut denied, Duration::from_secs(2)).await);

    let mut allowed = server.connect_from("127.0.0.3").await;
    let mut buf = BytesMut::new();
    assert_eq!(get(&mut allowed, &mut buf, "/").await.status, 200);
    server.stop().await;
}

#[tokio::test]
async fn most_specific_allow_overrides_broader_deny() {
    let mut config = test_config();
    config.ip_filter.policy = MatchPolicy::MostSpecific;
    config.ip_filter.deny = vec!["127.0.0.0/8".to_string()];
    config.ip_filter.allow = vec!["127.0.0.5".to_string()];
    let server = TestServer::start(config).await;

    let mut allowed = server.connect_from("127.0.0.5").await;
    let mut buf = BytesMut::new();
    assert_eq!(get(&mut allowed, &mut buf, "/").await.status, 200);

    let mut denied = server.connect_from("127.0.0.6").await;
    let mut buf = BytesMut::new();
    assert_eq!(read_response(&mut denied, &mut buf).await.status, 403);
    server.stop().await;
}

#[tokio::test]
async fn cors_mismatch_is_rejected_and_match_gets_headers() {
    let mut config = test_config();
    config.cors.enabled = true;
    config.cors.allowed_origins = vec!["https://app.test".to_string()];
    config.cors.on_mismatch = CorsMismatch::Reject;
    let server = TestServer::start(config).await;

    let mut stream = server.connect().await;
    let mut buf = BytesMut::new();

    stream
        .write_all(b"GET /data HTTP/1.1\r\nHost: test\r\nOrigin: https://app.test\r\n\r\n")
        .await
        .unwrap();
    let allowed = read_response(&mut stream, &mut buf).await;
    assert_eq!(allowed.status, 200);
    assert_eq!(allowed.header("access-control-allow-origin"), Some("https://app.test"));

    stream
        .write_all(b"GET /data HTTP/1.1\r\nHost: test\r\nOrigin: https://evil.test\r\n\r\n")
        .await
        .unwrap();
    let rejected = read_response(&mut stream, &mut buf).await;
    assert_eq!(rejected.status, 403);
    assert!(rejected.header("access-control-allow-origin").is_none());

    server.stop().await;
}
