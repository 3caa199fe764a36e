//! # 请求路由 / Request router
//!
//! Maps every inbound carrier request onto the session protocol:
//!
//! ```text
//! GET       <base><id>        -> download leg (long-lived streaming response)
//! POST|PUT  <base><id>/<seq>  -> upload segment
//! anything else               -> 404
//! ```
//!
//! Protocol errors never fail the carrier; each one becomes a per-request
//! status (400 malformed, 404 unknown/closed, 409 second download, 413
//! oversized upload).

use crate::carrier::{status_response, BodyStream, Handler};
use crate::config::SplitHttpConfig;
use crate::conn::SplitConn;
use crate::error::TransportError;
use crate::reorder::Submitted;
use crate::session::{RequestGuard, Session, SessionRegistry};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::{self, HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use once_cell::sync::OnceCell;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{debug, trace, warn};

/// First bytes of every download body.
pub const DOWNLOAD_PREAMBLE: &[u8] = b"ok";

const MAX_SESSION_ID_LEN: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Download { session: String },
    Upload { session: String, seq: u64 },
    BadRequest,
    NotFound,
}

fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn parse_seq(seq: &str) -> Option<u64> {
    if seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    seq.parse().ok()
}

/// Classify by method and path shape under `base` (normalized, ends in `/`).
pub fn classify(base: &str, method: &Method, path: &str) -> Route {
    let Some(rest) = path.strip_prefix(base) else {
        return Route::NotFound;
    };
    if rest.is_empty() {
        return Route::NotFound;
    }
    let parts: Vec<&str> = rest.split('/').collect();
    match parts.as_slice() {
        [id] if *method == Method::GET => {
            if valid_session_id(id) {
                Route::Download {
                    session: id.to_string(),
                }
            } else {
                Route::BadRequest
            }
        }
        [id, seq] if *method == Method::POST || *method == Method::PUT => {
            match (valid_session_id(id), parse_seq(seq)) {
                (true, Some(seq)) => Route::Upload {
                    session: id.to_string(),
                    seq,
                },
                _ => Route::BadRequest,
            }
        }
        _ => Route::NotFound,
    }
}

/// Remote address reported to the application: the forwarded IP when the
/// trusted header carries one, otherwise the carrier peer.
pub fn effective_remote(headers: &HeaderMap, trusted: Option<&HeaderName>, peer: SocketAddr) -> SocketAddr {
    let Some(name) = trusted else {
        return peer;
    };
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok())
        .map(|ip| SocketAddr::new(ip, 0))
        .unwrap_or(peer)
}

pub struct Router {
    base: String,
    host: Option<String>,
    forward_header: Option<HeaderName>,
    max_upload_size: usize,
    registry: Arc<SessionRegistry>,
    accept_tx: mpsc::Sender<SplitConn>,
    local_addr: OnceCell<SocketAddr>,
}

impl Router {
    pub fn new(
        config: &SplitHttpConfig,
        registry: Arc<SessionRegistry>,
        accept_tx: mpsc::Sender<SplitConn>,
    ) -> Result<Self, TransportError> {
        let forward_header = match &config.trusted_forward_header {
            Some(name) => Some(
                HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| TransportError::Config(format!("forward header {name:?}: {e}")))?,
            ),
            None => None,
        };
        Ok(Self {
            base: config.normalized_path(),
            host: (!config.host.is_empty()).then(|| config.host.clone()),
            forward_header,
            max_upload_size: config.max_upload_size,
            registry,
            accept_tx,
            local_addr: OnceCell::new(),
        })
    }

    pub(crate) fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.local_addr.set(addr);
    }

    fn host_matches<B>(&self, req: &Request<B>) -> bool {
        let Some(expected) = &self.host else {
            return true;
        };
        let got = req
            .uri()
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| {
                req.headers()
                    .get(header::HOST)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            });
        match got {
            Some(got) => got == *expected || strip_port(&got) == expected.as_str(),
            None => false,
        }
    }

    async fn upload(&self, id: String, seq: u64, body: BodyStream) -> Response<BodyStream> {
        let Some(session) = self.registry.get_or_create(&id) else {
            debug!(session = %id, seq, "upload for closed session");
            return status_response(StatusCode::NOT_FOUND);
        };
        let _guard = session.begin_request();

        let data = match read_capped(body, self.max_upload_size).await {
            Ok(data) => data,
            Err(BodyError::TooLarge) => {
                debug!(session = %id, seq, limit = self.max_upload_size, "upload too large");
                return status_response(StatusCode::PAYLOAD_TOO_LARGE);
            }
            Err(BodyError::Io(e)) => {
                debug!(session = %id, seq, error = %e, "upload body read failed");
                return status_response(StatusCode::BAD_REQUEST);
            }
        };
        let len = data.len();

        match session.reorder().submit(seq, data).await {
            Ok(outcome) => {
                trace!(session = %id, seq, len, ?outcome, "upload accepted");
                #[cfg(feature = "metrics")]
                {
                    let m = crate::metrics::global();
                    match outcome {
                        Submitted::Accepted => {
                            m.segments.with_label_values(&["accepted"]).inc();
                            m.bytes.with_label_values(&["up"]).inc_by(len as u64);
                        }
                        Submitted::Duplicate => m.segments.with_label_values(&["duplicate"]).inc(),
                    }
                }
                if outcome == Submitted::Duplicate {
                    debug!(session = %id, seq, "duplicate segment ignored");
                }
                status_response(StatusCode::OK)
            }
            Err(e @ TransportError::ReorderOverflow { .. }) => {
                warn!(session = %id, seq, error = %e, "tearing down session");
                self.registry.remove(&id);
                status_response(StatusCode::BAD_REQUEST)
            }
            Err(e) => {
                debug!(session = %id, seq, error = %e, "upload rejected");
                status_response(StatusCode::BAD_REQUEST)
            }
        }
    }

    fn download(&self, id: String, remote: SocketAddr) -> Response<BodyStream> {
        let Some(session) = self.registry.get_or_create(&id) else {
            debug!(session = %id, "download for closed session");
            return status_response(StatusCode::NOT_FOUND);
        };
        let Some((tx, rx)) = session.take_download() else {
            debug!(session = %id, "duplicate download leg");
            return status_response(StatusCode::CONFLICT);
        };
        session.set_remote_addr(remote);
        let guard = session.begin_request();

        let conn = SplitConn::server(
            session.clone(),
            self.registry.clone(),
            tx,
            remote,
            self.local_addr.get().copied(),
        );
        if let Err(e) = self.accept_tx.try_send(conn) {
            warn!(session = %id, error = %e, "accept queue unavailable");
            drop(guard);
            self.registry.remove(&id);
            return status_response(StatusCode::SERVICE_UNAVAILABLE);
        }
        debug!(session = %id, %remote, "download leg opened");

        let body = DownloadBody {
            preamble: Some(Bytes::from_static(DOWNLOAD_PREAMBLE)),
            rx,
            closed: Box::pin(session.closed_token().cancelled_owned()),
            session,
            registry: self.registry.clone(),
            finished: false,
            _guard: guard,
        };

        let mut resp = Response::new(Box::pin(body) as BodyStream);
        let headers = resp.headers_mut();
        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        resp
    }
}

#[async_trait]
impl Handler for Router {
    async fn handle(&self, req: Request<BodyStream>, peer: SocketAddr) -> Response<BodyStream> {
        if !self.host_matches(&req) {
            debug!(%peer, uri = %req.uri(), "host mismatch");
            return status_response(StatusCode::NOT_FOUND);
        }
        let route = classify(&self.base, req.method(), req.uri().path());
        trace!(%peer, method = %req.method(), path = req.uri().path(), ?route, "split-http request");
        match route {
            Route::NotFound => status_response(StatusCode::NOT_FOUND),
            Route::BadRequest => status_response(StatusCode::BAD_REQUEST),
            Route::Upload { session, seq } => self.upload(session, seq, req.into_body()).await,
            Route::Download { session } => {
                let remote = effective_remote(req.headers(), self.forward_header.as_ref(), peer);
                self.download(session, remote)
            }
        }
    }
}

fn strip_port(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}

enum BodyError {
    TooLarge,
    Io(io::Error),
}

async fn read_capped(mut body: BodyStream, limit: usize) -> Result<Bytes, BodyError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(BodyError::Io)?;
        if buf.len() + chunk.len() > limit {
            return Err(BodyError::TooLarge);
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

/// Download response body: the preamble, then whatever the server
/// connection writes into the session sink.
///
/// Dropped before the sink ends means the client went away; the session is
/// closed and removed.
struct DownloadBody {
    preamble: Option<Bytes>,
    rx: mpsc::Receiver<Bytes>,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
    session: Arc<Session>,
    registry: Arc<SessionRegistry>,
    finished: bool,
    _guard: RequestGuard,
}

impl Stream for DownloadBody {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(preamble) = self.preamble.take() {
            return Poll::Ready(Some(Ok(preamble)));
        }
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                self.session.touch();
                #[cfg(feature = "metrics")]
                crate::metrics::global()
                    .bytes
                    .with_label_values(&["down"])
                    .inc_by(chunk.len() as u64);
                return Poll::Ready(Some(Ok(chunk)));
            }
            Poll::Ready(None) => {
                self.finished = true;
                return Poll::Ready(None);
            }
            Poll::Pending => {}
        }
        if self.closed.as_mut().poll(cx).is_ready() {
            self.finished = true;
            return Poll::Ready(None);
        }
        Poll::Pending
    }
}

impl Drop for DownloadBody {
    fn drop(&mut self) {
        if !self.finished {
            debug!(session = %self.session.id(), "download leg dropped by peer");
            self.registry.remove(self.session.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::carrier::full_body;
    use crate::reorder::ReorderLimits;
    use std::time::Duration;

    fn router(config: &SplitHttpConfig) -> (Router, mpsc::Receiver<SplitConn>, Arc<SessionRegistry>) {
        let registry = Arc::new(SessionRegistry::new(
            ReorderLimits::from(config),
            Duration::from_secs(30),
        ));
        let (tx, rx) = mpsc::channel(8);
        (Router::new(config, registry.clone(), tx).unwrap(), rx, registry)
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:5555".parse().unwrap()
    }

    fn request(method: Method, path: &str, body: &'static [u8]) -> Request<BodyStream> {
        Request::builder()
            .method(method)
            .uri(path)
            .body(full_body(Bytes::from_static(body)))
            .unwrap()
    }

    #[test]
    fn test_classify() {
        let base = "/sh/";
        assert_eq!(
            classify(base, &Method::GET, "/sh/abc-123"),
            Route::Download {
                session: "abc-123".into()
            }
        );
        assert_eq!(
            classify(base, &Method::POST, "/sh/abc/7"),
            Route::Upload {
                session: "abc".into(),
                seq: 7
            }
        );
        assert_eq!(
            classify(base, &Method::PUT, "/sh/abc/0"),
            Route::Upload {
                session: "abc".into(),
                seq: 0
            }
        );
        assert_eq!(classify(base, &Method::POST, "/sh/abc/+1"), Route::BadRequest);
        assert_eq!(classify(base, &Method::POST, "/sh/abc/x"), Route::BadRequest);
        assert_eq!(classify(base, &Method::GET, "/sh/a.b"), Route::BadRequest);
        assert_eq!(classify(base, &Method::GET, "/"), Route::NotFound);
        assert_eq!(classify(base, &Method::GET, "/sh/"), Route::NotFound);
        assert_eq!(classify(base, &Method::GET, "/other/abc"), Route::NotFound);
        assert_eq!(classify(base, &Method::DELETE, "/sh/abc"), Route::NotFound);
        assert_eq!(classify(base, &Method::GET, "/sh/abc/0"), Route::NotFound);
        assert_eq!(classify(base, &Method::POST, "/sh/a/b/c"), Route::NotFound);
        assert_eq!(classify("/", &Method::GET, "/"), Route::NotFound);
        let long = format!("/{}", "a".repeat(129));
        assert_eq!(classify("/", &Method::GET, &long), Route::BadRequest);
    }

    #[test]
    fn test_effective_remote() {
        let name = HeaderName::from_static("x-forwarded-for");
        let mut headers = HeaderMap::new();
        assert_eq!(effective_remote(&headers, Some(&name), peer()), peer());

        headers.insert("x-forwarded-for", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(
            effective_remote(&headers, Some(&name), peer()),
            "1.1.1.1:0".parse::<SocketAddr>().unwrap()
        );
        assert_eq!(effective_remote(&headers, None, peer()), peer());

        headers.insert("x-forwarded-for", HeaderValue::from_static("2001:db8::1, 10.0.0.2"));
        assert_eq!(
            effective_remote(&headers, Some(&name), peer()),
            "[2001:db8::1]:0".parse::<SocketAddr>().unwrap()
        );

        headers.insert("x-forwarded-for", HeaderValue::from_static("not-an-ip"));
        assert_eq!(effective_remote(&headers, Some(&name), peer()), peer());
    }

    #[test]
    fn test_strip_port() {
        assert_eq!(strip_port("example.com:443"), "example.com");
        assert_eq!(strip_port("example.com"), "example.com");
        assert_eq!(strip_port("[::1]:8080"), "::1");
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let config = SplitHttpConfig::with_path("/sh");
        let (router, mut accepted, registry) = router(&config);

        let resp = router
            .handle(request(Method::POST, "/sh/s1/1", b"world"), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = router
            .handle(request(Method::POST, "/sh/s1/0", b"hello "), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = router.handle(request(Method::GET, "/sh/s1", b""), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        let mut body = resp.into_body();
        assert_eq!(&body.next().await.unwrap().unwrap()[..], DOWNLOAD_PREAMBLE);

        let conn = accepted.recv().await.unwrap();
        assert_eq!(conn.session_id(), "s1");
        assert_eq!(conn.remote_addr(), Some(peer()));
        let session = registry.get("s1").unwrap();
        let chunk = session.reorder().read_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello ");

        // second download for the same id
        let resp = router.handle(request(Method::GET, "/sh/s1", b""), peer()).await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        // client gone: body dropped mid-stream tears the session down
        drop(body);
        assert!(session.is_closed());
        assert!(registry.get("s1").is_none());
        let resp = router
            .handle(request(Method::POST, "/sh/s1/2", b"late"), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        drop(conn);
    }

    #[tokio::test]
    async fn test_upload_limits() {
        let config = SplitHttpConfig {
            max_upload_size: 4,
            ..SplitHttpConfig::with_path("/sh")
        };
        let (router, _accepted, _registry) = router(&config);
        let resp = router
            .handle(request(Method::POST, "/sh/s1/0", b"too long"), peer())
            .await;
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let resp = router.handle(request(Method::POST, "/sh/s1/0", b"ok"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let resp = router.handle(request(Method::POST, "/sh/s1/0", b"ok"), peer()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_reorder_overflow_tears_down() {
        let config = SplitHttpConfig {
            max_pending_segments: 2,
            max_reorder_window: 2,
            ..SplitHttpConfig::with_path("/sh")
        };
        let (router, _accepted, registry) = router(&config);
        let resp = router.handle(request(Method::POST, "/sh/s1/9", b"x"), peer()).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(registry.get("s1").is_none());
        assert!(registry.is_tombstoned("s1"));
    }

    #[tokio::test]
    async fn test_host_check() {
        let config = SplitHttpConfig {
            host: "example.com".into(),
            ..SplitHttpConfig::with_path("/sh")
        };
        let (router, _accepted, _registry) = router(&config);

        let resp = router.handle(request(Method::POST, "/sh/s1/0", b"x"), peer()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let req = Request::post("/sh/s1/0")
            .header(header::HOST, "example.com")
            .body(full_body(Bytes::from_static(b"x")))
            .unwrap();
        assert_eq!(router.handle(req, peer()).await.status(), StatusCode::OK);

        let req = Request::post("https://example.com:443/sh/s1/1")
            .body(full_body(Bytes::from_static(b"y")))
            .unwrap();
        assert_eq!(router.handle(req, peer()).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_foreign_paths_404() {
        let (router, _accepted, registry) = router(&SplitHttpConfig::with_path("/sh"));
        for (method, path) in [
            (Method::GET, "/"),
            (Method::GET, "/robots.txt"),
            (Method::POST, "/sh/abc"),
            (Method::DELETE, "/sh/abc"),
        ] {
            let resp = router.handle(request(method, path, b""), peer()).await;
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{path}");
        }
        assert!(registry.is_empty());
    }
}
