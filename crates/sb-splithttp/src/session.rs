//! # 会话注册表 / Session registry
//!
//! Server-side state keyed by session id. Every request handler resolves its
//! session here, holds an `Arc<Session>` plus a `RequestGuard` for the
//! duration of the request, and the periodic evictor closes sessions that saw
//! no activity and have nothing in flight.
//!
//! Closed ids are tombstoned for one idle interval so late uploads are
//! rejected instead of silently creating a fresh session.

use crate::reorder::{ReorderBuffer, ReorderLimits};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Download sink depth, in write chunks.
pub const DOWNLOAD_QUEUE_DEPTH: usize = 32;

pub struct Session {
    id: String,
    reorder: Arc<ReorderBuffer>,
    download: Mutex<Option<(mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>)>>,
    last_activity: Mutex<Instant>,
    in_flight: AtomicUsize,
    closed: AtomicBool,
    shutdown: CancellationToken,
    remote_addr: Mutex<Option<SocketAddr>>,
}

impl Session {
    pub fn new(id: impl Into<String>, limits: ReorderLimits) -> Self {
        let (tx, rx) = mpsc::channel(DOWNLOAD_QUEUE_DEPTH);
        Self {
            id: id.into(),
            reorder: Arc::new(ReorderBuffer::new(limits)),
            download: Mutex::new(Some((tx, rx))),
            last_activity: Mutex::new(Instant::now()),
            in_flight: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            remote_addr: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn reorder(&self) -> &Arc<ReorderBuffer> {
        &self.reorder
    }

    /// Mark the start of a request; the guard keeps the session from being evicted.
    pub fn begin_request(self: &Arc<Self>) -> RequestGuard {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        self.touch();
        RequestGuard {
            session: self.clone(),
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Download sink, handed out to the first GET only.
    pub fn take_download(&self) -> Option<(mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>)> {
        self.download.lock().take()
    }

    pub fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock() = Some(addr);
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock()
    }

    /// Cancelled once the session closes; download bodies and writers watch it.
    pub fn closed_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the reorder buffer and the download leg. True for the call that
    /// performed the transition.
    pub fn close(&self) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.reorder.close();
        self.download.lock().take();
        self.shutdown.cancel();
        debug!(session = %self.id, "session closed");
        #[cfg(feature = "metrics")]
        crate::metrics::global().sessions_active.dec();
        true
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("in_flight", &self.in_flight())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// RAII in-flight marker returned by `Session::begin_request`.
pub struct RequestGuard {
    session: Arc<Session>,
}

impl RequestGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        self.session.touch();
        self.session.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct SessionRegistry {
    sessions: DashMap<String, Arc<Session>>,
    tombstones: DashMap<String, Instant>,
    limits: ReorderLimits,
    tombstone_ttl: Duration,
}

impl SessionRegistry {
    pub fn new(limits: ReorderLimits, tombstone_ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            tombstones: DashMap::new(),
            limits,
            tombstone_ttl,
        }
    }

    /// Existing session for `id`, or a new one. `None` when the id is tombstoned.
    pub fn get_or_create(&self, id: &str) -> Option<Arc<Session>> {
        if let Some(session) = self.sessions.get(id) {
            return Some(session.clone());
        }
        if self.is_tombstoned(id) {
            return None;
        }
        let session = self
            .sessions
            .entry(id.to_string())
            .or_insert_with(|| {
                debug!(session = %id, "session created");
                #[cfg(feature = "metrics")]
                crate::metrics::global().sessions_active.inc();
                Arc::new(Session::new(id, self.limits))
            })
            .clone();
        // lost a race with `remove`
        if self.is_tombstoned(id) {
            self.sessions.remove(id);
            session.close();
            return None;
        }
        Some(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn is_tombstoned(&self, id: &str) -> bool {
        self.tombstones.contains_key(id)
    }

    /// Close and forget `id`, leaving a tombstone behind.
    pub fn remove(&self, id: &str) -> Option<Arc<Session>> {
        self.tombstones.insert(id.to_string(), Instant::now());
        let removed = self.sessions.remove(id).map(|(_, s)| s);
        if let Some(session) = &removed {
            session.close();
        }
        removed
    }

    /// Close every session idle for at least `threshold` with no request in
    /// flight, plus any already closed. Expired tombstones are purged.
    pub fn evict_idle(&self, threshold: Duration) -> usize {
        let victims: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| {
                let s = entry.value();
                s.is_closed() || (s.in_flight() == 0 && s.idle_for() >= threshold)
            })
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for id in victims {
            // re-check under the shard lock; a request may have arrived meanwhile
            let still_idle = self.sessions.get(&id).is_some_and(|s| {
                s.is_closed() || (s.in_flight() == 0 && s.idle_for() >= threshold)
            });
            if still_idle && self.remove(&id).is_some() {
                debug!(session = %id, "idle session evicted");
                evicted += 1;
            }
        }

        let ttl = self.tombstone_ttl;
        self.tombstones.retain(|_, closed_at| closed_at.elapsed() < ttl);

        #[cfg(feature = "metrics")]
        crate::metrics::global()
            .sessions_evicted
            .inc_by(evicted as u64);
        evicted
    }

    /// Periodic sweep until `shutdown` fires.
    pub async fn run_evictor(
        self: Arc<Self>,
        period: Duration,
        threshold: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(period) => {}
            }
            let evicted = self.evict_idle(threshold);
            if evicted > 0 {
                info!(evicted, remaining = self.len(), "split-http evictor sweep");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SessionRegistry {
        SessionRegistry::new(ReorderLimits::default(), Duration::from_secs(30))
    }

    #[test]
    fn test_get_or_create_is_shared() {
        let reg = registry();
        let a = reg.get_or_create("abc").unwrap();
        let b = reg.get_or_create("abc").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(reg.len(), 1);
        assert!(reg.get("other").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_joins_one_session() {
        let reg = Arc::new(registry());
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let reg = reg.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    reg.get_or_create("same").unwrap()
                })
            })
            .collect();

        let mut sessions = Vec::new();
        for task in tasks {
            sessions.push(task.await.unwrap());
        }
        assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));
        assert_eq!(reg.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_remove_racing_create_leaves_no_live_session() {
        for round in 0..200 {
            let reg = Arc::new(registry());
            let id = format!("race-{round}");
            let barrier = Arc::new(tokio::sync::Barrier::new(2));

            let creator = {
                let (reg, id, barrier) = (reg.clone(), id.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    reg.get_or_create(&id)
                })
            };
            let remover = {
                let (reg, id, barrier) = (reg.clone(), id.clone(), barrier.clone());
                tokio::spawn(async move {
                    barrier.wait().await;
                    reg.remove(&id)
                })
            };

            let created = creator.await.unwrap();
            remover.await.unwrap();

            // whichever side won, the id ends tombstoned and nothing stays open
            assert!(reg.is_tombstoned(&id));
            assert!(reg.get(&id).is_none());
            assert!(reg.is_empty());
            if let Some(session) = created {
                assert!(session.is_closed());
            }
            assert!(reg.get_or_create(&id).is_none());
        }
    }

    #[test]
    fn test_remove_tombstones_id() {
        let reg = registry();
        let s = reg.get_or_create("abc").unwrap();
        reg.remove("abc");
        assert!(s.is_closed());
        assert!(reg.is_tombstoned("abc"));
        assert!(reg.get_or_create("abc").is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_close_is_once() {
        let s = Session::new("x", ReorderLimits::default());
        assert!(s.close());
        assert!(!s.close());
        assert!(s.reorder().is_closed());
        assert!(s.take_download().is_none());
        assert!(s.closed_token().is_cancelled());
    }

    #[test]
    fn test_download_taken_once() {
        let s = Session::new("x", ReorderLimits::default());
        assert!(s.take_download().is_some());
        assert!(s.take_download().is_none());
    }

    #[tokio::test]
    async fn test_evict_skips_in_flight() {
        let reg = registry();
        let busy = reg.get_or_create("busy").unwrap();
        let _idle = reg.get_or_create("idle").unwrap();
        let guard = busy.begin_request();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reg.evict_idle(Duration::from_millis(10)), 1);
        assert!(reg.get("busy").is_some());
        assert!(reg.get("idle").is_none());

        drop(guard);
        assert_eq!(busy.in_flight(), 0);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(reg.evict_idle(Duration::from_millis(10)), 1);
        assert!(busy.is_closed());
    }

    #[tokio::test]
    async fn test_tombstones_expire() {
        let reg = SessionRegistry::new(ReorderLimits::default(), Duration::from_millis(10));
        reg.get_or_create("gone").unwrap();
        reg.remove("gone");
        assert!(reg.is_tombstoned("gone"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        reg.evict_idle(Duration::from_secs(60));
        assert!(!reg.is_tombstoned("gone"));
    }

    #[tokio::test]
    async fn test_run_evictor_stops_on_shutdown() {
        let reg = Arc::new(registry());
        reg.get_or_create("a").unwrap();
        let token = CancellationToken::new();
        let task = tokio::spawn(reg.clone().run_evictor(
            Duration::from_millis(10),
            Duration::from_millis(5),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reg.is_empty());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
