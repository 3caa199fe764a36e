//! # 上行重排缓冲 / Upload reorder buffer
//!
//! Upload segments may complete out of order when several POSTs are in
//! flight. The buffer releases bytes strictly in sequence order:
//! 上行分段可能乱序到达，缓冲区严格按序号顺序释放字节：
//!
//! - `seq < next_expected`: duplicate, dropped / 重复分段，丢弃
//! - `seq == next_expected`: appended to the ready queue, then any contiguous
//!   pending segments cascade after it / 进入就绪队列并级联释放
//! - `seq > next_expected`: parked in `pending` / 暂存等待补齐
//!
//! Soft limits (pending count/bytes, ready bytes) suspend the submitter; the
//! hard `max_reorder_window` aborts the buffer.

use crate::config::SplitHttpConfig;
use crate::error::TransportError;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::task::{Context, Poll, Waker};
use tokio::io::ReadBuf;
use tokio::sync::Notify;
use tracing::{debug, trace};

#[derive(Debug, Clone, Copy)]
pub struct ReorderLimits {
    pub max_pending_segments: usize,
    pub max_pending_bytes: usize,
    pub max_ready_bytes: usize,
    pub max_reorder_window: u64,
}

impl Default for ReorderLimits {
    fn default() -> Self {
        ReorderLimits::from(&SplitHttpConfig::default())
    }
}

impl From<&SplitHttpConfig> for ReorderLimits {
    fn from(config: &SplitHttpConfig) -> Self {
        Self {
            max_pending_segments: config.max_pending_segments,
            max_pending_bytes: config.max_pending_bytes,
            max_ready_bytes: config.max_ready_bytes,
            max_reorder_window: config.max_reorder_window,
        }
    }
}

/// Result of a successful `submit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Segment is now part of the stream (ready or pending)
    Accepted,
    /// Segment was already seen and has been dropped
    Duplicate,
}

#[derive(Debug, Default)]
struct State {
    next_expected: u64,
    pending: BTreeMap<u64, Bytes>,
    pending_bytes: usize,
    ready: VecDeque<Bytes>,
    ready_bytes: usize,
    closed: bool,
    aborted: Option<(u64, u64)>,
    reader: Option<Waker>,
}

impl State {
    fn push_ready(&mut self, data: Bytes) {
        self.ready_bytes += data.len();
        if !data.is_empty() {
            self.ready.push_back(data);
        }
        self.next_expected += 1;
    }

    fn cascade(&mut self) {
        while let Some(data) = self.pending.remove(&self.next_expected) {
            self.pending_bytes -= data.len();
            self.push_ready(data);
        }
    }

    fn take_reader(&mut self) -> Option<Waker> {
        self.reader.take()
    }
}

pub struct ReorderBuffer {
    state: Mutex<State>,
    submitters: Notify,
    limits: ReorderLimits,
}

impl ReorderBuffer {
    pub fn new(limits: ReorderLimits) -> Self {
        Self {
            state: Mutex::new(State::default()),
            submitters: Notify::new(),
            limits,
        }
    }

    /// Hand one segment to the buffer, suspending while the soft limits are hit.
    pub async fn submit(&self, seq: u64, data: Bytes) -> Result<Submitted, TransportError> {
        loop {
            let notified = self.submitters.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let reader = {
                let mut st = self.state.lock();
                if let Some((seq, next_expected)) = st.aborted {
                    return Err(TransportError::ReorderOverflow { seq, next_expected });
                }
                if st.closed {
                    return Err(TransportError::Closed);
                }
                if seq < st.next_expected || st.pending.contains_key(&seq) {
                    trace!(seq, next_expected = st.next_expected, "duplicate segment dropped");
                    return Ok(Submitted::Duplicate);
                }

                let distance = seq - st.next_expected;
                if distance > self.limits.max_reorder_window {
                    let next_expected = st.next_expected;
                    drop(st);
                    self.abort(seq, next_expected);
                    return Err(TransportError::ReorderOverflow { seq, next_expected });
                }

                let ready_full = st.ready_bytes >= self.limits.max_ready_bytes;
                if distance == 0 {
                    if ready_full {
                        None
                    } else {
                        st.push_ready(data.clone());
                        st.cascade();
                        trace!(seq, next_expected = st.next_expected, "segment released");
                        Some(st.take_reader())
                    }
                } else {
                    let backlog_full = st.pending.len() >= self.limits.max_pending_segments
                        || st.pending_bytes >= self.limits.max_pending_bytes;
                    if ready_full || backlog_full {
                        None
                    } else {
                        st.pending_bytes += data.len();
                        st.pending.insert(seq, data.clone());
                        trace!(seq, next_expected = st.next_expected, "segment parked");
                        Some(None)
                    }
                }
            };

            match reader {
                Some(reader) => {
                    if let Some(w) = reader {
                        w.wake();
                    }
                    // a filled gap may unblock submitters waiting on the backlog
                    self.submitters.notify_waiters();
                    return Ok(Submitted::Accepted);
                }
                None => {
                    trace!(seq, "submit suspended by backpressure");
                    notified.await;
                }
            }
        }
    }

    /// Copy ready bytes into `buf`. Zero bytes written with `Ready(Ok)` is EOF.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let mut st = self.state.lock();
        if st.aborted.is_some() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "upload reorder window exceeded",
            )));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut copied = 0;
        while buf.remaining() > 0 {
            let Some(front) = st.ready.front_mut() else {
                break;
            };
            let n = front.len().min(buf.remaining());
            buf.put_slice(&front.split_to(n));
            if front.is_empty() {
                st.ready.pop_front();
            }
            copied += n;
        }

        if copied > 0 {
            st.ready_bytes -= copied;
            drop(st);
            self.submitters.notify_waiters();
            return Poll::Ready(Ok(()));
        }
        if st.closed {
            return Poll::Ready(Ok(()));
        }
        st.reader = Some(cx.waker().clone());
        Poll::Pending
    }

    /// Pop one whole ready chunk; `None` once closed and drained.
    pub fn poll_chunk(&self, cx: &mut Context<'_>) -> Poll<Option<io::Result<Bytes>>> {
        let mut st = self.state.lock();
        if st.aborted.is_some() {
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "upload reorder window exceeded",
            ))));
        }
        if let Some(chunk) = st.ready.pop_front() {
            st.ready_bytes -= chunk.len();
            drop(st);
            self.submitters.notify_waiters();
            return Poll::Ready(Some(Ok(chunk)));
        }
        if st.closed {
            return Poll::Ready(None);
        }
        st.reader = Some(cx.waker().clone());
        Poll::Pending
    }

    pub async fn read_chunk(&self) -> Option<io::Result<Bytes>> {
        poll_fn(|cx| self.poll_chunk(cx)).await
    }

    /// Stop accepting segments. Ready bytes stay readable; parked ones are dropped.
    /// Returns true for the call that performed the transition.
    pub fn close(&self) -> bool {
        let reader = {
            let mut st = self.state.lock();
            if st.closed {
                return false;
            }
            st.closed = true;
            st.pending.clear();
            st.pending_bytes = 0;
            st.take_reader()
        };
        if let Some(w) = reader {
            w.wake();
        }
        self.submitters.notify_waiters();
        true
    }

    fn abort(&self, seq: u64, next_expected: u64) {
        debug!(seq, next_expected, "reorder window exceeded, aborting");
        let reader = {
            let mut st = self.state.lock();
            st.aborted = Some((seq, next_expected));
            st.closed = true;
            st.pending.clear();
            st.pending_bytes = 0;
            st.ready.clear();
            st.ready_bytes = 0;
            st.take_reader()
        };
        if let Some(w) = reader {
            w.wake();
        }
        self.submitters.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted.is_some()
    }

    pub fn next_expected(&self) -> u64 {
        self.state.lock().next_expected
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn ready_bytes(&self) -> usize {
        self.state.lock().ready_bytes
    }
}

impl std::fmt::Debug for ReorderBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("ReorderBuffer")
            .field("next_expected", &st.next_expected)
            .field("pending", &st.pending.len())
            .field("ready_bytes", &st.ready_bytes)
            .field("closed", &st.closed)
            .finish()
    }
}
