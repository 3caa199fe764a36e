//! # TCP 载体 / TCP carriers
//!
//! HTTP/1.1, TLS (HTTP/2 or HTTP/1.1 by ALPN) and cleartext HTTP/2 with
//! prior knowledge, all on hyper.
//!
//! Client: HTTP/1.1 keeps a pool of keep-alive connections and opens a new
//! one whenever every pooled connection is busy (the download leg pins one
//! for its whole life). HTTP/2 multiplexes everything over one connection,
//! redialed when it dies.
//!
//! Server: one task per accepted connection, served by hyper-util's auto
//! builder which speaks HTTP/1.1 and switches to HTTP/2 on the preface.

use super::{into_absolute, BodyStream, Handler, Requester, ServerHandle};
use crate::config::{CarrierKind, SplitHttpConfig};
use crate::dialer::{IoStream, TcpDialer};
use crate::error::TransportError;
use crate::tls::{self, TlsDialer, ALPN_H2};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use http::{Request, Response, Version};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::client::conn::{http1, http2};
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use parking_lot::Mutex;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ClientBody = Full<Bytes>;
type ServerBody = UnsyncBoxBody<Bytes, io::Error>;

pub(crate) fn incoming_stream(body: Incoming) -> BodyStream {
    Box::pin(body.into_data_stream().map_err(io::Error::other))
}

fn into_hyper_response(resp: Response<BodyStream>) -> Response<ServerBody> {
    resp.map(|body| StreamBody::new(body.map_ok(Frame::data)).boxed_unsync())
}

/// TCP connect plus optional TLS handshake.
struct Connector {
    tcp: TcpDialer,
    tls: Option<TlsDialer>,
}

struct Opened {
    io: IoStream,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    h2_negotiated: bool,
}

impl Connector {
    async fn open(&self, host: &str, port: u16) -> Result<Opened, TransportError> {
        let tcp = self.tcp.connect_tcp(host, port).await?;
        let local_addr = tcp.local_addr().ok();
        let peer_addr = tcp.peer_addr().ok();
        match &self.tls {
            None => Ok(Opened {
                io: Box::new(tcp),
                local_addr,
                peer_addr,
                h2_negotiated: false,
            }),
            Some(tls) => {
                let stream = tls.handshake(Box::new(tcp), host).await?;
                let h2_negotiated = stream.get_ref().1.alpn_protocol() == Some(ALPN_H2);
                Ok(Opened {
                    io: Box::new(stream),
                    local_addr,
                    peer_addr,
                    h2_negotiated,
                })
            }
        }
    }
}

enum Mode {
    Http1(Mutex<Vec<http1::SendRequest<ClientBody>>>),
    Http2(tokio::sync::Mutex<http2::SendRequest<ClientBody>>),
}

/// Client side of the TCP carriers.
pub struct HttpRequester {
    connector: Connector,
    host: String,
    port: u16,
    scheme: &'static str,
    dial_timeout: Duration,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
    mode: Mode,
}

impl HttpRequester {
    /// Dial the first connection eagerly so carrier failures surface from `dial`.
    pub async fn connect(
        host: &str,
        port: u16,
        authority: String,
        config: &SplitHttpConfig,
    ) -> Result<Self, TransportError> {
        let carrier = config.carrier();
        let tls = match (carrier, &config.tls) {
            (CarrierKind::Tls, Some(tls_config)) => Some(TlsDialer::new(
                tls::client_config(tls_config)?,
                tls_config.server_name.clone(),
            )),
            _ => None,
        };
        let scheme = if tls.is_some() { "https" } else { "http" };
        let connector = Connector {
            tcp: TcpDialer::default(),
            tls,
        };
        let dial_timeout = config.dial_timeout();

        let opened = timeout(dial_timeout, connector.open(host, port)).await??;
        let use_h2 = opened.h2_negotiated || carrier == CarrierKind::H2c;
        let local_addr = opened.local_addr;
        let peer_addr = opened.peer_addr;
        let mode = if use_h2 {
            Mode::Http2(tokio::sync::Mutex::new(handshake_h2(opened.io).await?))
        } else {
            Mode::Http1(Mutex::new(vec![handshake_h1(opened.io).await?]))
        };
        let version = if use_h2 { Version::HTTP_2 } else { Version::HTTP_11 };
        debug!(host, port, %authority, ?version, "split-http carrier connected");

        Ok(Self {
            connector,
            host: host.to_string(),
            port,
            scheme,
            dial_timeout,
            local_addr,
            peer_addr,
            mode,
        })
    }

    async fn open(&self) -> Result<IoStream, TransportError> {
        let opened = timeout(self.dial_timeout, self.connector.open(&self.host, self.port)).await??;
        Ok(opened.io)
    }

    fn checkout(pool: &Mutex<Vec<http1::SendRequest<ClientBody>>>) -> Option<http1::SendRequest<ClientBody>> {
        let mut pool = pool.lock();
        pool.retain(|s| !s.is_closed());
        let idx = pool.iter().position(|s| s.is_ready())?;
        Some(pool.swap_remove(idx))
    }
}

#[async_trait]
impl Requester for HttpRequester {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<BodyStream>, TransportError> {
        let req = req.map(Full::new);
        let resp = match &self.mode {
            Mode::Http1(pool) => {
                let mut sender = match Self::checkout(pool) {
                    Some(sender) => sender,
                    None => {
                        debug!(host = %self.host, "opening pooled http/1.1 connection");
                        handshake_h1(self.open().await?).await?
                    }
                };
                let resp = sender.send_request(req).await?;
                // busy until the response body is drained; `checkout` skips it until then
                pool.lock().push(sender);
                resp
            }
            Mode::Http2(cached) => {
                let req = into_absolute(req, self.scheme)?;
                let mut sender = {
                    let mut guard = cached.lock().await;
                    if guard.is_closed() {
                        debug!(host = %self.host, "http/2 connection closed, redialing");
                        *guard = handshake_h2(self.open().await?).await?;
                    }
                    guard.clone()
                };
                sender.ready().await?;
                sender.send_request(req).await?
            }
        };
        Ok(resp.map(incoming_stream))
    }

    fn version(&self) -> Version {
        match self.mode {
            Mode::Http1(_) => Version::HTTP_11,
            Mode::Http2(_) => Version::HTTP_2,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
}

async fn handshake_h1(io: IoStream) -> Result<http1::SendRequest<ClientBody>, TransportError> {
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http/1.1 client connection ended");
        }
    });
    Ok(sender)
}

async fn handshake_h2(io: IoStream) -> Result<http2::SendRequest<ClientBody>, TransportError> {
    let (sender, conn) = http2::handshake(TokioExecutor::new(), TokioIo::new(io)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "http/2 client connection ended");
        }
    });
    Ok(sender)
}

/// Bind a TCP listener (TLS when configured) and serve every connection.
pub async fn serve(
    addr: SocketAddr,
    config: &SplitHttpConfig,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, TransportError> {
    let acceptor = match &config.tls {
        Some(tls_config) => Some(TlsAcceptor::from(Arc::new(tls::server_config(tls_config)?))),
        None => None,
    };
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    info!(%local_addr, tls = acceptor.is_some(), "split-http tcp carrier listening");

    let handshake_timeout = config.dial_timeout();
    let task = tokio::spawn(accept_loop(
        listener,
        acceptor,
        handler,
        shutdown,
        handshake_timeout,
    ));
    Ok(ServerHandle { local_addr, task })
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
    handshake_timeout: Duration,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "split-http accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);

        let acceptor = acceptor.clone();
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let io: IoStream = match acceptor {
                None => Box::new(stream),
                Some(acceptor) => match timeout(handshake_timeout, acceptor.accept(stream)).await {
                    Ok(Ok(tls)) => Box::new(tls),
                    Ok(Err(e)) => {
                        debug!(%peer, error = %e, "tls accept failed");
                        return;
                    }
                    Err(_) => {
                        debug!(%peer, "tls accept timed out");
                        return;
                    }
                },
            };
            serve_connection(io, peer, handler, shutdown).await;
        });
    }
    debug!("split-http tcp accept loop stopped");
}

async fn serve_connection(
    io: IoStream,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move {
            let req = req.map(incoming_stream);
            let resp = handler.handle(req, peer).await;
            Ok::<_, Infallible>(into_hyper_response(resp))
        }
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(TokioIo::new(io), service);
    tokio::select! {
        res = conn => {
            if let Err(e) = res {
                debug!(%peer, error = %e, "split-http connection ended with error");
            }
        }
        _ = shutdown.cancelled() => {}
    }
}
