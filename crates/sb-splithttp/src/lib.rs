//! # sb-splithttp: Split-HTTP Transport / 分离式 HTTP 传输
//!
//! Carries one ordered, bidirectional byte stream over plain HTTP requests:
//! a long-lived `GET` streams server-to-client bytes, and the client sends
//! its bytes as a series of sequenced `POST` requests that the server
//! reassembles in order. Both ends see an ordinary `AsyncRead + AsyncWrite`
//! connection ([`SplitConn`]).
//!
//! 通过普通 HTTP 请求承载一条有序的双向字节流：长连接 `GET` 承载下行数据，
//! 上行数据被切分为带序号的 `POST` 请求，由服务端按序重组。
//!
//! ## Carriers / 载体
//! - TCP + HTTP/1.1
//! - TCP + TLS, HTTP/2 or HTTP/1.1 by ALPN
//! - cleartext HTTP/2 (h2c), selected with `alpn = ["h2"]` and no TLS
//! - QUIC + HTTP/3, selected with `tls.alpn = ["h3"]`
//!
//! ## Usage
//!
//! ```no_run
//! use sb_splithttp::{dial, SplitHttpConfig, SplitHttpListener};
//! use tokio::io::{AsyncReadExt, AsyncWriteExt};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SplitHttpConfig::with_path("/sh");
//! let listener = SplitHttpListener::bind("127.0.0.1:0".parse()?, &config).await?;
//! let port = listener.local_addr().port();
//!
//! let mut client = dial("127.0.0.1", port, &config).await?;
//! let mut server = listener.accept().await?;
//! client.write_all(b"ping").await?;
//! let mut buf = [0u8; 4];
//! server.read_exact(&mut buf).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//! - `metrics`: Prometheus counters in a crate-local registry / 指标

/// Carrier abstraction over HTTP/1.1, HTTP/2 and HTTP/3
/// 基于 HTTP/1.1、HTTP/2、HTTP/3 的载体抽象
pub mod carrier;

/// Client session driver: download leg and sequenced uploads
/// 客户端会话：下行请求与带序号的上行请求
pub mod client;

pub mod config;
pub mod conn;

/// TCP dialer with Happy Eyeballs
/// TCP 拨号器
pub mod dialer;

pub mod error;
pub mod listener;

/// Reorder buffer turning out-of-order segments into a byte stream
/// 将乱序分片重组为字节流的重排缓冲区
pub mod reorder;

pub mod router;
pub mod session;

/// rustls client/server configuration and TLS dialer
/// rustls 配置与 TLS 拨号器
pub mod tls;

#[cfg(feature = "metrics")]
pub mod metrics;

// Re-exports for a stable public surface
// 重新导出核心类型
pub use client::{dial, SplitHttpDialer};
pub use config::{CarrierKind, CertificateKey, SplitHttpConfig, TlsConfig};
pub use conn::SplitConn;
pub use dialer::{Dialer, IoStream, TcpDialer};
pub use error::TransportError;
pub use listener::SplitHttpListener;
pub use reorder::{ReorderBuffer, ReorderLimits, Submitted};
