//! Helpers shared by the split-HTTP integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use http::{header, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use sb_splithttp::{CertificateKey, SplitConn, SplitHttpConfig, SplitHttpListener, TlsConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;

pub const PATH: &str = "/sh";

pub async fn bind(config: &SplitHttpConfig) -> Arc<SplitHttpListener> {
    sb_test_utils::init_tracing();
    Arc::new(
        SplitHttpListener::bind("127.0.0.1:0".parse().unwrap(), config)
            .await
            .unwrap(),
    )
}

/// Echo every accepted connection until the client half-closes.
pub fn spawn_echo(listener: Arc<SplitHttpListener>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok(conn) = listener.accept().await {
            tokio::spawn(echo(conn));
        }
    })
}

async fn echo(mut conn: SplitConn) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        match conn.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if conn.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        }
    }
}

/// Per connection: read one message, answer with `reply`, then close.
pub fn spawn_responder<F>(listener: Arc<SplitHttpListener>, reply: F) -> JoinHandle<()>
where
    F: Fn(&SplitConn) -> Vec<u8> + Send + Sync + 'static,
{
    let reply = Arc::new(reply);
    tokio::spawn(async move {
        while let Ok(mut conn) = listener.accept().await {
            let reply = reply.clone();
            tokio::spawn(async move {
                conn.set_read_deadline(Some(tokio::time::Instant::now() + Duration::from_secs(2)));
                let mut buf = [0u8; 1024];
                match conn.read(&mut buf).await {
                    Ok(n) if n > 0 => {}
                    _ => return,
                }
                let answer = reply(&conn);
                if conn.write_all(&answer).await.is_ok() {
                    let _ = conn.close().await;
                }
            });
        }
    })
}

/// Read whatever arrives first; enough for the short replies above.
pub async fn read_some(conn: &mut SplitConn) -> Vec<u8> {
    let mut buf = [0u8; 1024];
    let n = timeout(Duration::from_secs(5), conn.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    buf[..n].to_vec()
}

/// Server certificate config for `localhost` with the given ALPN.
pub fn server_tls(alpn: &[&str]) -> TlsConfig {
    let (chain, key) = sb_test_utils::tls::self_signed("localhost");
    TlsConfig {
        alpn: alpn.iter().map(|s| s.to_string()).collect(),
        certificate: Some(CertificateKey::new(chain, key)),
        ..Default::default()
    }
}

/// Client config that trusts any certificate.
pub fn client_tls(alpn: &[&str]) -> TlsConfig {
    TlsConfig {
        server_name: Some("localhost".into()),
        allow_insecure: true,
        alpn: alpn.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Write `data` and read the same number of bytes back.
pub async fn round_trip(conn: &mut SplitConn, data: &[u8]) -> Vec<u8> {
    conn.write_all(data).await.unwrap();
    let mut out = vec![0u8; data.len()];
    conn.read_exact(&mut out).await.unwrap();
    out
}

/// One HTTP/1.1 request on a fresh connection, bypassing the split-HTTP client.
pub async fn raw_request(
    addr: SocketAddr,
    method: Method,
    path: &str,
    body: &'static [u8],
) -> Response<Incoming> {
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);
    let req = Request::builder()
        .method(method)
        .uri(path)
        .header(header::HOST, addr.to_string())
        .body(Full::new(Bytes::from_static(body)))
        .unwrap();
    sender.send_request(req).await.unwrap()
}

pub async fn raw_status(addr: SocketAddr, method: Method, path: &str, body: &'static [u8]) -> StatusCode {
    let resp = raw_request(addr, method, path, body).await;
    let status = resp.status();
    let _ = resp.into_body().collect().await;
    status
}

/// Read a streaming response body until `want` bytes arrived.
pub async fn read_body(resp: Response<Incoming>, want: usize) -> Vec<u8> {
    let mut body = resp.into_body();
    let mut out = Vec::new();
    while out.len() < want {
        let frame = tokio::time::timeout(Duration::from_secs(5), body.frame())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Ok(data) = frame.into_data() {
            out.extend_from_slice(&data);
        }
    }
    out
}
