//! # 网络拨号器抽象模块 / Dialer abstraction
//!
//! - `AsyncReadWrite` / `IoStream`: 统一的异步 IO 流类型
//! - `Dialer` trait: 异步网络连接拨号器接口
//! - `TcpDialer`: 基础 TCP 拨号器（Happy Eyeballs, RFC 8305）

use crate::error::TransportError;
use async_trait::async_trait;
use futures::future::{select_ok, FutureExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream};
use tokio::time::sleep;
use tracing::debug;

/// 异步读写 trait 标记
pub trait AsyncReadWrite: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

impl<T> AsyncReadWrite for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send {}

/// Boxed byte stream with a static lifetime
pub type IoStream = Box<dyn AsyncReadWrite + 'static>;

/// 异步网络拨号器 trait
///
/// Carriers build their TCP leg through this trait; `SplitHttpDialer`
/// implements it as well so a split-HTTP connection can stand wherever any
/// other transport stream is expected.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// 建立到指定主机和端口的连接
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, TransportError>;
}

/// 基础 TCP 拨号器
///
/// 同时尝试 IPv6 和 IPv4，IPv4 延迟 `ipv4_delay` 启动；第一个成功的连接胜出。
#[derive(Debug, Clone)]
pub struct TcpDialer {
    pub ipv4_delay: Duration,
    pub nodelay: bool,
}

impl Default for TcpDialer {
    fn default() -> Self {
        let delay_ms = std::env::var("SB_HE_DELAY_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(50);
        Self {
            ipv4_delay: Duration::from_millis(delay_ms),
            nodelay: true,
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn connect(&self, host: &str, port: u16) -> Result<IoStream, TransportError> {
        Ok(Box::new(self.connect_tcp(host, port).await?))
    }
}

impl TcpDialer {
    /// Resolve and connect, keeping the concrete stream for address queries.
    pub async fn connect_tcp(&self, host: &str, port: u16) -> Result<TcpStream, TransportError> {
        let addrs: Vec<SocketAddr> = lookup_host((host, port)).await?.collect();
        if addrs.is_empty() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no addresses found for {host}"),
            )));
        }
        self.connect_addrs(addrs).await
    }

    /// Happy Eyeballs over an already resolved address list.
    pub async fn connect_addrs(&self, addrs: Vec<SocketAddr>) -> Result<TcpStream, TransportError> {
        let (ipv6_addrs, ipv4_addrs): (Vec<_>, Vec<_>) =
            addrs.into_iter().partition(|addr| addr.is_ipv6());
        debug!(
            ipv6 = ipv6_addrs.len(),
            ipv4 = ipv4_addrs.len(),
            "tcp dial candidates"
        );

        if ipv6_addrs.is_empty() || ipv4_addrs.is_empty() {
            let all = if ipv6_addrs.is_empty() { ipv4_addrs } else { ipv6_addrs };
            return self.try_connect_addrs(&all).await;
        }

        let mut attempts = Vec::new();
        for addr in &ipv6_addrs {
            attempts.push(self.connect_one(*addr).boxed());
        }
        for (i, addr) in ipv4_addrs.iter().enumerate() {
            let delay = if i == 0 { self.ipv4_delay } else { self.ipv4_delay * 2 };
            let addr = *addr;
            attempts.push(
                async move {
                    sleep(delay).await;
                    self.connect_one(addr).await
                }
                .boxed(),
            );
        }

        // Losing attempts are dropped (and their sockets closed) with the rest of the set.
        let (stream, _rest) = select_ok(attempts).await?;
        Ok(stream)
    }

    async fn try_connect_addrs(&self, addrs: &[SocketAddr]) -> Result<TcpStream, TransportError> {
        let mut last_error =
            TransportError::Io(std::io::Error::other("no addresses provided"));
        for addr in addrs {
            match self.connect_one(*addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    debug!(%addr, error = %e, "tcp connect failed");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }

    async fn connect_one(&self, addr: SocketAddr) -> Result<TcpStream, TransportError> {
        let stream = TcpStream::connect(addr).await?;
        if self.nodelay {
            stream.set_nodelay(true)?;
        }
        Ok(stream)
    }
}
