//! # 监听器 / Listener
//!
//! Binds the server carrier, spawns the idle evictor and hands out one
//! [`SplitConn`] per accepted download leg.
//! 绑定服务端载体，启动空闲清理任务，每个下载请求产出一个 `SplitConn`。

use crate::carrier::{self, ServerHandle};
use crate::config::SplitHttpConfig;
use crate::conn::SplitConn;
use crate::error::TransportError;
use crate::reorder::ReorderLimits;
use crate::router::Router;
use crate::session::SessionRegistry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Sessions waiting for `accept`. A full queue answers the download with 503.
const ACCEPT_QUEUE_DEPTH: usize = 128;

pub struct SplitHttpListener {
    local_addr: SocketAddr,
    registry: Arc<SessionRegistry>,
    accept_rx: Mutex<mpsc::Receiver<SplitConn>>,
    shutdown: CancellationToken,
    carrier_task: JoinHandle<()>,
    evictor_task: JoinHandle<()>,
}

impl SplitHttpListener {
    /// Bind the carrier selected by `config` on `addr`.
    pub async fn bind(addr: SocketAddr, config: &SplitHttpConfig) -> Result<Self, TransportError> {
        let mut config = config.clone();
        config.apply_env_overrides();
        config.validate()?;

        let registry = Arc::new(SessionRegistry::new(
            ReorderLimits::from(&config),
            config.session_idle_timeout(),
        ));
        let shutdown = CancellationToken::new();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        let router = Arc::new(Router::new(&config, registry.clone(), accept_tx)?);

        let ServerHandle { local_addr, task } =
            carrier::serve(addr, &config, router.clone(), shutdown.child_token()).await?;
        router.set_local_addr(local_addr);

        let evictor_task = tokio::spawn(registry.clone().run_evictor(
            config.evict_interval(),
            config.session_idle_timeout(),
            shutdown.child_token(),
        ));
        info!(
            %local_addr,
            carrier = ?config.carrier(),
            path = %config.normalized_path(),
            "split-http listener started"
        );

        Ok(Self {
            local_addr,
            registry,
            accept_rx: Mutex::new(accept_rx),
            shutdown,
            carrier_task: task,
            evictor_task,
        })
    }

    /// Next session whose download leg has been established.
    pub async fn accept(&self) -> Result<SplitConn, TransportError> {
        let mut rx = self.accept_rx.lock().await;
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(TransportError::Closed),
            conn = rx.recv() => conn.ok_or(TransportError::Closed),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live sessions, including ones not yet accepted.
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Stop the carrier and evictor and close every session. Idempotent.
    pub fn close(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.registry.close_all();
        info!(local_addr = %self.local_addr, "split-http listener closed");
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for SplitHttpListener {
    fn drop(&mut self) {
        self.close();
        self.evictor_task.abort();
        if self.carrier_task.is_finished() {
            return;
        }
        // the accept loop exits on the cancelled token; abort covers a stuck handshake
        self.carrier_task.abort();
    }
}

impl std::fmt::Debug for SplitHttpListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SplitHttpListener")
            .field("local_addr", &self.local_addr)
            .field("sessions", &self.registry.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
