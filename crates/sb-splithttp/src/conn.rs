//! # 连接适配器 / Connection adapter
//!
//! `SplitConn` presents one split-HTTP session as an ordinary byte stream
//! (`AsyncRead + AsyncWrite`), on both ends:
//!
//! | role | read side | write side |
//! |---|---|---|
//! | client | GET response body | uploader queue (POST segments) |
//! | server | session reorder buffer | download sink (GET response body) |
//!
//! Deadlines are timers owned by the connection, independent of the
//! carrier; an expired deadline fails the pending operation with
//! `ErrorKind::TimedOut` and never consumes data.

use crate::carrier::{BodyStream, Requester};
use crate::client::UploadState;
use crate::error::TransportError;
use crate::reorder::ReorderBuffer;
use crate::session::{Session, SessionRegistry};
use bytes::Bytes;
use std::future::{poll_fn, Future};
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant, Sleep};
use tokio_util::io::StreamReader;
use tokio_util::sync::PollSender;
use tracing::debug;

enum ReadSide {
    Download(StreamReader<BodyStream, Bytes>),
    Reorder(Arc<ReorderBuffer>),
    Closed,
}

enum Role {
    Client {
        uploader: Option<JoinHandle<()>>,
        state: Arc<UploadState>,
        carrier: Arc<dyn Requester>,
    },
    Server {
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
    },
}

#[derive(Default)]
struct Deadline {
    at: Option<Instant>,
    timer: Option<Pin<Box<Sleep>>>,
}

impl Deadline {
    fn set(&mut self, at: Option<Instant>) {
        self.at = at;
        self.timer = at.map(|t| Box::pin(sleep_until(t)));
    }

    /// Registers the waker while the deadline is pending.
    fn poll_expired(&mut self, cx: &mut Context<'_>) -> bool {
        let (Some(at), Some(timer)) = (self.at, &mut self.timer) else {
            return false;
        };
        // the timer wheel has millisecond granularity; the clock decides
        Instant::now() >= at || timer.as_mut().poll(cx).is_ready()
    }
}

fn timed_out() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "split-http deadline exceeded")
}

fn broken_pipe(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, msg.to_string())
}

pub struct SplitConn {
    session_id: String,
    read: ReadSide,
    write: PollSender<Bytes>,
    max_write_chunk: usize,
    read_deadline: Deadline,
    write_deadline: Deadline,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    role: Role,
    closed: bool,
}

impl SplitConn {
    pub(crate) fn client(
        session_id: String,
        download: BodyStream,
        upload_tx: mpsc::Sender<Bytes>,
        uploader: JoinHandle<()>,
        state: Arc<UploadState>,
        carrier: Arc<dyn Requester>,
        max_write_chunk: usize,
    ) -> Self {
        let local_addr = carrier.local_addr();
        let remote_addr = carrier.peer_addr();
        Self {
            session_id,
            read: ReadSide::Download(StreamReader::new(download)),
            write: PollSender::new(upload_tx),
            max_write_chunk,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            local_addr,
            remote_addr,
            role: Role::Client {
                uploader: Some(uploader),
                state,
                carrier,
            },
            closed: false,
        }
    }

    pub(crate) fn server(
        session: Arc<Session>,
        registry: Arc<SessionRegistry>,
        download_tx: mpsc::Sender<Bytes>,
        remote_addr: SocketAddr,
        local_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            session_id: session.id().to_string(),
            read: ReadSide::Reorder(session.reorder().clone()),
            write: PollSender::new(download_tx),
            max_write_chunk: usize::MAX,
            read_deadline: Deadline::default(),
            write_deadline: Deadline::default(),
            local_addr,
            remote_addr: Some(remote_addr),
            role: Role::Server { session, registry },
            closed: false,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Carrier peer, or the forwarded address on the server when trusted.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn set_read_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
    }

    pub fn set_write_deadline(&mut self, at: Option<Instant>) {
        self.write_deadline.set(at);
    }

    pub fn set_deadline(&mut self, at: Option<Instant>) {
        self.read_deadline.set(at);
        self.write_deadline.set(at);
    }

    pub fn read_deadline(&self) -> Option<Instant> {
        self.read_deadline.at
    }

    pub fn write_deadline(&self) -> Option<Instant> {
        self.write_deadline.at
    }

    fn write_error(&self) -> Option<io::Error> {
        if self.closed {
            return Some(io::Error::new(io::ErrorKind::NotConnected, "connection closed"));
        }
        match &self.role {
            Role::Client { state, .. } => state
                .failure()
                .map(|msg| TransportError::UploadFailed(msg).into()),
            Role::Server { session, .. } if session.is_closed() => {
                Some(broken_pipe("session closed"))
            }
            Role::Server { .. } => None,
        }
    }

    /// Half-close the write side; reads keep draining.
    ///
    /// Client: waits for queued uploads to finish. Server: ends the download body.
    fn poll_close_write(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.write.close();
        if let Role::Client { uploader, state, .. } = &mut self.role {
            if let Some(handle) = uploader {
                let _ = ready!(Pin::new(handle).poll(cx));
                *uploader = None;
            }
            if let Some(msg) = state.failure() {
                return Poll::Ready(Err(TransportError::UploadFailed(msg).into()));
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Full close: flush and drop both legs. Idempotent.
    pub async fn close(&mut self) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        let flushed = poll_fn(|cx| self.poll_close_write(cx)).await;
        self.closed = true;
        self.read = ReadSide::Closed;
        match &self.role {
            Role::Server { session, registry } => {
                registry.remove(session.id());
            }
            Role::Client { carrier, .. } => carrier.close(),
        }
        debug!(session = %self.session_id, "split-http connection closed");
        flushed
    }
}

impl AsyncRead for SplitConn {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.read_deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        match &mut this.read {
            ReadSide::Download(reader) => Pin::new(reader).poll_read(cx, buf),
            ReadSide::Reorder(reorder) => reorder.poll_read(cx, buf),
            ReadSide::Closed => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection closed",
            ))),
        }
    }
}

impl AsyncWrite for SplitConn {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_deadline.poll_expired(cx) {
            return Poll::Ready(Err(timed_out()));
        }
        if let Some(e) = this.write_error() {
            return Poll::Ready(Err(e));
        }
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }
        if ready!(this.write.poll_reserve(cx)).is_err() {
            return Poll::Ready(Err(this
                .write_error()
                .unwrap_or_else(|| broken_pipe("write side closed"))));
        }
        let n = buf.len().min(this.max_write_chunk);
        if this.write.send_item(Bytes::copy_from_slice(&buf[..n])).is_err() {
            return Poll::Ready(Err(broken_pipe("write side closed")));
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_close_write(cx)
    }
}

impl Drop for SplitConn {
    fn drop(&mut self) {
        if let Role::Server { session, registry } = &self.role {
            if !self.closed {
                registry.remove(session.id());
            }
        }
    }
}

impl std::fmt::Debug for SplitConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitConn")
            .field("session_id", &self.session_id)
            .field("local_addr", &self.local_addr)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.closed)
            .finish()
    }
}
