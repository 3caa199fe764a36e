//! # 载体抽象 / Carrier abstraction
//!
//! The session protocol only needs "send a request, get a streaming
//! response" on the client and "hand every request to a handler" on the
//! server. This module gives both sides that shape over four carriers:
//! 会话协议在以下四种载体上运行：
//!
//! | carrier | client | server |
//! |---|---|---|
//! | TCP + HTTP/1.1 | keep-alive pool (`http::Mode::Http1`) | hyper auto builder |
//! | TCP + TLS (h2 / http/1.1 by ALPN) | `TlsDialer` + pool or h2 | `TlsAcceptor` + auto builder |
//! | cleartext HTTP/2 (h2c) | prior-knowledge `http2` | auto builder (preface detect) |
//! | QUIC + HTTP/3 | `h3` over `quinn` | `h3` server over `quinn` |

pub mod h3;
pub mod http;

use crate::config::{CarrierKind, SplitHttpConfig};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use ::http::{header, Request, Response, StatusCode, Uri, Version};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Streaming HTTP body as seen by the session layer.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

pub fn empty_body() -> BodyStream {
    Box::pin(futures::stream::empty())
}

pub fn full_body(data: Bytes) -> BodyStream {
    Box::pin(futures::stream::once(async move { Ok(data) }))
}

/// Bare response with an empty body.
pub fn status_response(status: StatusCode) -> Response<BodyStream> {
    let mut resp = Response::new(empty_body());
    *resp.status_mut() = status;
    resp
}

/// Client half of a carrier.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Issue one request. The URI is origin-form and the authority travels in
    /// the `Host` header; carriers that need absolute-form rewrite it.
    async fn send(&self, req: Request<Bytes>) -> Result<Response<BodyStream>, TransportError>;

    /// HTTP version spoken on this carrier.
    fn version(&self) -> Version;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// Tear down the underlying connection once the session is done with it.
    /// TCP carriers close when dropped; QUIC needs an explicit close.
    fn close(&self) {}
}

/// Server half: every inbound request lands here with the carrier peer.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, req: Request<BodyStream>, peer: SocketAddr) -> Response<BodyStream>;
}

/// Bound server carrier.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Open a client carrier to `host:port` as selected by `config.carrier()`.
pub async fn dial(
    host: &str,
    port: u16,
    config: &SplitHttpConfig,
) -> Result<Arc<dyn Requester>, TransportError> {
    let authority = authority_for(host, port, config);
    match config.carrier() {
        CarrierKind::H3 => Ok(Arc::new(
            h3::H3Requester::connect(host, port, authority, config).await?,
        )),
        _ => Ok(Arc::new(
            http::HttpRequester::connect(host, port, authority, config).await?,
        )),
    }
}

/// Bind the server carrier selected by `config.carrier()`.
pub async fn serve(
    addr: SocketAddr,
    config: &SplitHttpConfig,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, TransportError> {
    match config.carrier() {
        CarrierKind::H3 => h3::serve(addr, config, handler, shutdown).await,
        _ => http::serve(addr, config, handler, shutdown).await,
    }
}

/// Authority the client presents: configured `host`, else `host:port`.
pub(crate) fn authority_for(host: &str, port: u16, config: &SplitHttpConfig) -> String {
    if !config.host.is_empty() {
        return config.host.clone();
    }
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Rewrite an origin-form request into absolute form, consuming the `Host` header.
pub(crate) fn into_absolute<B>(mut req: Request<B>, scheme: &str) -> Result<Request<B>, TransportError> {
    let authority = match req.headers_mut().remove(header::HOST) {
        Some(v) => v
            .to_str()
            .map_err(TransportError::http)?
            .to_string(),
        None => req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| TransportError::Http("request without authority".into()))?,
    };
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/")
        .to_string();
    *req.uri_mut() = Uri::builder()
        .scheme(scheme)
        .authority(authority.as_str())
        .path_and_query(path.as_str())
        .build()?;
    Ok(req)
}
