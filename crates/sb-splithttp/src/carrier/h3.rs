//! # QUIC 载体 / QUIC + HTTP/3 carrier
//!
//! Client: one quinn connection driven by an `h3` client; every request
//! opens its own bidirectional stream. Server: quinn endpoint with an `h3`
//! connection per peer and a task per request stream.

use super::{into_absolute, BodyStream, Handler, Requester, ServerHandle};
use crate::config::SplitHttpConfig;
use crate::error::TransportError;
use crate::tls;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use futures::future::poll_fn;
use futures::StreamExt;
use h3::error::ErrorLevel;
use h3::server::RequestStream;
use http::{Request, Response, Version};
use quinn::crypto::rustls::{QuicClientConfig, QuicServerConfig};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type ClientSender = h3::client::SendRequest<h3_quinn::OpenStreams, Bytes>;

/// HTTP/3 `H3_NO_ERROR` application close code.
const H3_NO_ERROR: quinn::VarInt = quinn::VarInt::from_u32(0x100);

/// Response body over an h3 receive half; ends after the first error.
fn recv_stream<S>(stream: S) -> BodyStream
where
    S: RecvData + Send + 'static,
{
    Box::pin(futures::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.recv_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(stream))),
            Ok(None) => None,
            Err(e) => Some((Err(e), None)),
        }
    }))
}

/// Common shape of the client and server receive halves.
#[async_trait]
trait RecvData {
    async fn recv_chunk(&mut self) -> io::Result<Option<Bytes>>;
}

#[async_trait]
impl RecvData for h3::client::RequestStream<h3_quinn::BidiStream<Bytes>, Bytes> {
    async fn recv_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.recv_data().await {
            Ok(Some(mut buf)) => Ok(Some(buf.copy_to_bytes(buf.remaining()))),
            Ok(None) => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

#[async_trait]
impl RecvData for RequestStream<h3_quinn::RecvStream, Bytes> {
    async fn recv_chunk(&mut self) -> io::Result<Option<Bytes>> {
        match self.recv_data().await {
            Ok(Some(mut buf)) => Ok(Some(buf.copy_to_bytes(buf.remaining()))),
            Ok(None) => Ok(None),
            Err(e) => Err(io::Error::other(e)),
        }
    }
}

pub struct H3Requester {
    _endpoint: quinn::Endpoint,
    // the h3 driver task keeps its own handle alive until the peer closes
    conn: quinn::Connection,
    sender: ClientSender,
    local_addr: Option<SocketAddr>,
    remote: SocketAddr,
}

impl H3Requester {
    pub async fn connect(
        host: &str,
        port: u16,
        authority: String,
        config: &SplitHttpConfig,
    ) -> Result<Self, TransportError> {
        let tls_config = config
            .tls
            .as_ref()
            .ok_or_else(|| TransportError::Config("http/3 requires tls".into()))?;
        let remote = lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| {
                TransportError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no addresses found for {host}"),
                ))
            })?;

        let bind: SocketAddr = if remote.is_ipv6() {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv4Addr::UNSPECIFIED, 0).into()
        };
        let mut endpoint = quinn::Endpoint::client(bind)?;
        let crypto = tls::quic_client_config(tls_config)?;
        let quic_crypto = QuicClientConfig::try_from(crypto).map_err(TransportError::tls)?;
        endpoint.set_default_client_config(quinn::ClientConfig::new(Arc::new(quic_crypto)));

        let server_name = tls_config.server_name.clone().unwrap_or_else(|| host.to_string());
        let connecting = endpoint
            .connect(remote, &server_name)
            .map_err(TransportError::tls)?;
        let conn = timeout(config.dial_timeout(), connecting)
            .await?
            .map_err(|e| TransportError::Io(io::Error::other(e)))?;
        let local_addr = endpoint.local_addr().ok();

        let (mut driver, sender) =
            h3::client::new(h3_quinn::Connection::new(conn.clone())).await?;
        tokio::spawn(async move {
            let res = poll_fn(|cx| driver.poll_close(cx)).await;
            debug!(result = ?res.err(), "http/3 client connection closed");
        });
        debug!(%remote, %authority, "split-http http/3 carrier connected");

        Ok(Self {
            _endpoint: endpoint,
            conn,
            sender,
            local_addr,
            remote,
        })
    }
}

#[async_trait]
impl Requester for H3Requester {
    async fn send(&self, req: Request<Bytes>) -> Result<Response<BodyStream>, TransportError> {
        let req = into_absolute(req, "https")?;
        let (parts, body) = req.into_parts();
        let mut sender = self.sender.clone();
        let mut stream = sender.send_request(Request::from_parts(parts, ())).await?;
        if !body.is_empty() {
            stream.send_data(body).await?;
        }
        stream.finish().await?;
        let resp = stream.recv_response().await?;
        Ok(resp.map(|()| recv_stream(stream)))
    }

    fn version(&self) -> Version {
        Version::HTTP_3
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn close(&self) {
        if self.conn.close_reason().is_none() {
            debug!(remote = %self.remote, "closing http/3 carrier");
            self.conn.close(H3_NO_ERROR, b"closed");
        }
    }
}

impl Drop for H3Requester {
    fn drop(&mut self) {
        self.close();
    }
}

/// Bind a QUIC endpoint speaking `h3`.
pub async fn serve(
    addr: SocketAddr,
    config: &SplitHttpConfig,
    handler: Arc<dyn Handler>,
    shutdown: CancellationToken,
) -> Result<ServerHandle, TransportError> {
    let tls_config = config
        .tls
        .as_ref()
        .ok_or_else(|| TransportError::Config("http/3 requires tls".into()))?;
    let crypto = tls::quic_server_config(tls_config)?;
    let quic_crypto = QuicServerConfig::try_from(crypto).map_err(TransportError::tls)?;
    let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_crypto));
    let endpoint = quinn::Endpoint::server(server_config, addr)?;
    let local_addr = endpoint.local_addr()?;
    info!(%local_addr, "split-http quic carrier listening");

    let task = tokio::spawn(accept_loop(endpoint, handler, shutdown));
    Ok(ServerHandle { local_addr, task })
}

async fn accept_loop(endpoint: quinn::Endpoint, handler: Arc<dyn Handler>, shutdown: CancellationToken) {
    loop {
        let incoming = tokio::select! {
            _ = shutdown.cancelled() => break,
            incoming = endpoint.accept() => match incoming {
                Some(incoming) => incoming,
                None => break,
            },
        };
        let handler = handler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let conn = match incoming.await {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(error = %e, "quic handshake failed");
                    return;
                }
            };
            let peer = conn.remote_address();
            tokio::select! {
                res = serve_connection(conn, peer, handler) => {
                    if let Err(e) = res {
                        debug!(%peer, error = %e, "http/3 connection ended");
                    }
                }
                _ = shutdown.cancelled() => {}
            }
        });
    }
    endpoint.close(0u32.into(), b"shutdown");
    debug!("split-http quic accept loop stopped");
}

async fn serve_connection(
    conn: quinn::Connection,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
) -> Result<(), TransportError> {
    let mut h3_conn: h3::server::Connection<h3_quinn::Connection, Bytes> =
        h3::server::Connection::new(h3_quinn::Connection::new(conn.clone())).await?;
    loop {
        match h3_conn.accept().await {
            Ok(Some((req, stream))) => {
                let handler = handler.clone();
                let conn = conn.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_request(req, stream, conn, peer, handler).await {
                        warn!(%peer, error = %e, "http/3 request failed");
                    }
                });
            }
            Ok(None) => return Ok(()),
            Err(e) => match e.get_error_level() {
                ErrorLevel::StreamError => {
                    debug!(%peer, error = %e, "http/3 stream error");
                    continue;
                }
                ErrorLevel::ConnectionError => return Err(e.into()),
            },
        }
    }
}

/// Serve one request stream. A pending response body is dropped as soon as
/// the QUIC connection goes away, so a download never outlives its peer.
async fn serve_request(
    req: Request<()>,
    stream: RequestStream<h3_quinn::BidiStream<Bytes>, Bytes>,
    conn: quinn::Connection,
    peer: SocketAddr,
    handler: Arc<dyn Handler>,
) -> Result<(), TransportError> {
    let (mut send, recv) = stream.split();
    let req = req.map(|()| recv_stream(recv));
    let resp = handler.handle(req, peer).await;

    let (parts, mut body) = resp.into_parts();
    let pump = async {
        send.send_response(Response::from_parts(parts, ())).await?;
        while let Some(chunk) = body.next().await {
            send.send_data(chunk?).await?;
        }
        send.finish().await?;
        Ok::<_, TransportError>(())
    };
    tokio::select! {
        res = pump => res,
        reason = conn.closed() => {
            debug!(%peer, %reason, "http/3 connection closed, dropping response body");
            Ok(())
        }
    }
}
