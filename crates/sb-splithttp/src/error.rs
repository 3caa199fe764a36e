//! # Transport error taxonomy / 传输错误分类
//!
//! One error type for every layer of the split-HTTP transport:
//! 为 split-HTTP 传输的每一层提供统一的错误类型：
//! - carrier failures (refused, handshake, timeout) surface from `dial`/`bind`
//!   载体错误（拒绝连接、握手失败、超时）由 `dial`/`bind` 返回
//! - session-protocol failures become per-request HTTP statuses on the server
//!   会话协议错误在服务端转换为单个请求的 HTTP 状态码
//! - connection-scoped failures reach `SplitConn` callers as `std::io::Error`
//!   连接级错误以 `std::io::Error` 的形式传递给 `SplitConn` 调用者

use http::StatusCode;
use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    /// Underlying network IO failed
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// TLS configuration or handshake failure
    #[error("tls: {0}")]
    Tls(String),

    /// HTTP framing / protocol failure reported by hyper or h3
    #[error("http: {0}")]
    Http(String),

    /// Peer answered with an unexpected status
    #[error("unexpected status: {0}")]
    Status(StatusCode),

    /// Invalid configuration
    #[error("config: {0}")]
    Config(String),

    #[error("timeout")]
    Timeout,

    /// Session or connection already closed
    #[error("closed")]
    Closed,

    /// A segment arrived too far ahead of the reassembly point
    #[error("segment {seq} exceeds reorder window (next expected {next_expected})")]
    ReorderOverflow { seq: u64, next_expected: u64 },

    /// An upload request failed; the connection cannot continue in order
    #[error("upload failed: {0}")]
    UploadFailed(String),
}

impl TransportError {
    pub(crate) fn http(e: impl std::fmt::Display) -> Self {
        TransportError::Http(e.to_string())
    }

    pub(crate) fn tls(e: impl std::fmt::Display) -> Self {
        TransportError::Tls(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TransportError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        TransportError::Timeout
    }
}

impl From<hyper::Error> for TransportError {
    fn from(e: hyper::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}

impl From<h3::Error> for TransportError {
    fn from(e: h3::Error) -> Self {
        TransportError::Http(format!("h3: {e}"))
    }
}

impl From<http::Error> for TransportError {
    fn from(e: http::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}

/// Connection-facing mapping used at the `AsyncRead`/`AsyncWrite` boundary.
impl From<TransportError> for io::Error {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Io(e) => e,
            TransportError::Timeout => io::Error::new(io::ErrorKind::TimedOut, "timeout"),
            TransportError::Closed => io::Error::new(io::ErrorKind::NotConnected, "closed"),
            TransportError::UploadFailed(msg) => {
                io::Error::new(io::ErrorKind::BrokenPipe, format!("upload failed: {msg}"))
            }
            TransportError::ReorderOverflow { .. } => {
                io::Error::new(io::ErrorKind::ConnectionAborted, e.to_string())
            }
            other => io::Error::other(other.to_string()),
        }
    }
}
