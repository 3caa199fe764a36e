//! Wire-level checks with a plain HTTP/1.1 client: routing, out-of-order and
//! duplicate segments, upload limits and idle eviction.

mod common;

use common::{bind, raw_request, raw_status, read_body, PATH};
use http::{Method, StatusCode};
use sb_splithttp::SplitHttpConfig;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;

#[tokio::test]
async fn test_foreign_paths_are_404() {
    let listener = bind(&SplitHttpConfig::with_path(PATH)).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::GET, "/", b"").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::GET, "/sh/", b"").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::GET, "/other/abc", b"").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::POST, "/sh/abc", b"x").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::DELETE, "/sh/abc/0", b"").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::GET, "/sh/abc/0/extra", b"").await, StatusCode::NOT_FOUND);
    assert_eq!(listener.session_count(), 0);
}

#[tokio::test]
async fn test_malformed_requests_are_400() {
    let listener = bind(&SplitHttpConfig::with_path(PATH)).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::POST, "/sh/abc/-1", b"x").await, StatusCode::BAD_REQUEST);
    assert_eq!(raw_status(addr, Method::POST, "/sh/abc/zz", b"x").await, StatusCode::BAD_REQUEST);
    assert_eq!(raw_status(addr, Method::GET, "/sh/a%20b", b"").await, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_out_of_order_uploads_are_reassembled() {
    let listener = bind(&SplitHttpConfig::with_path(PATH)).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::POST, "/sh/ooo/2", b"ef").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/ooo/1", b"cd").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::PUT, "/sh/ooo/0", b"ab").await, StatusCode::OK);

    let download = raw_request(addr, Method::GET, "/sh/ooo", b"").await;
    assert_eq!(download.status(), StatusCode::OK);
    assert_eq!(download.headers()["cache-control"], "no-store");

    let mut server = listener.accept().await.unwrap();
    assert_eq!(server.session_id(), "ooo");
    let mut buf = [0u8; 6];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abcdef");

    server.write_all(b"xyz").await.unwrap();
    assert_eq!(read_body(download, 5).await, b"okxyz");
}

#[tokio::test]
async fn test_duplicate_segments_are_ignored() {
    let listener = bind(&SplitHttpConfig::with_path(PATH)).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::POST, "/sh/dup/0", b"ab").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/dup/0", b"zz").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/dup/2", b"ef").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/dup/2", b"yy").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/dup/1", b"cd").await, StatusCode::OK);

    let _download = raw_request(addr, Method::GET, "/sh/dup", b"").await;
    let mut server = listener.accept().await.unwrap();
    let mut buf = [0u8; 6];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"abcdef");
}

#[tokio::test]
async fn test_second_download_conflicts() {
    let listener = bind(&SplitHttpConfig::with_path(PATH)).await;
    let addr = listener.local_addr();

    let first = raw_request(addr, Method::GET, "/sh/twice", b"").await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(raw_status(addr, Method::GET, "/sh/twice", b"").await, StatusCode::CONFLICT);
    assert_eq!(read_body(first, 2).await, b"ok");
}

#[tokio::test]
async fn test_oversized_upload_is_413() {
    let config = SplitHttpConfig {
        max_upload_size: 4,
        ..SplitHttpConfig::with_path(PATH)
    };
    let listener = bind(&config).await;
    let addr = listener.local_addr();

    assert_eq!(
        raw_status(addr, Method::POST, "/sh/big/0", b"too large").await,
        StatusCode::PAYLOAD_TOO_LARGE
    );
    assert_eq!(raw_status(addr, Method::POST, "/sh/big/0", b"fits").await, StatusCode::OK);
}

#[tokio::test]
async fn test_reorder_window_overflow_tears_down_session() {
    let config = SplitHttpConfig {
        max_pending_segments: 4,
        max_reorder_window: 8,
        ..SplitHttpConfig::with_path(PATH)
    };
    let listener = bind(&config).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::POST, "/sh/far/0", b"a").await, StatusCode::OK);
    assert_eq!(raw_status(addr, Method::POST, "/sh/far/100", b"b").await, StatusCode::BAD_REQUEST);
    assert_eq!(raw_status(addr, Method::POST, "/sh/far/1", b"c").await, StatusCode::NOT_FOUND);
    assert_eq!(raw_status(addr, Method::GET, "/sh/far", b"").await, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_idle_session_is_evicted() {
    let config = SplitHttpConfig {
        session_idle_timeout_ms: 200,
        evict_interval_ms: 50,
        ..SplitHttpConfig::with_path(PATH)
    };
    let listener = bind(&config).await;
    let addr = listener.local_addr();

    assert_eq!(raw_status(addr, Method::POST, "/sh/idle/0", b"a").await, StatusCode::OK);
    assert_eq!(listener.session_count(), 1);

    timeout(Duration::from_secs(5), async {
        while listener.session_count() > 0 {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_host_mismatch_is_404() {
    let config = SplitHttpConfig {
        host: "cdn.example.com".into(),
        ..SplitHttpConfig::with_path(PATH)
    };
    let listener = bind(&config).await;
    let addr = listener.local_addr();

    // raw requests carry the socket address as Host
    assert_eq!(raw_status(addr, Method::POST, "/sh/h/0", b"a").await, StatusCode::NOT_FOUND);

    let mut conn = sb_splithttp::dial("127.0.0.1", addr.port(), &config).await.unwrap();
    let mut server = listener.accept().await.unwrap();
    conn.write_all(b"host ok").await.unwrap();
    let mut buf = [0u8; 7];
    server.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"host ok");
}
