//! Split-HTTP configuration model
//!
//! Shared by the dial and listen paths. Field names follow the sb-config
//! transport conventions so the struct can be embedded in a JSON outbound or
//! inbound definition as-is.

use crate::error::TransportError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// Upper bound for `max_concurrent_uploads`.
pub const MAX_CONCURRENT_UPLOADS: usize = 1024;

/// Which of the four carriers a configuration selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CarrierKind {
    /// TCP + HTTP/1.1
    Http1,
    /// Cleartext HTTP/2 with prior knowledge
    H2c,
    /// TCP + TLS, HTTP/1.1 or HTTP/2 by ALPN
    Tls,
    /// QUIC + HTTP/3
    H3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitHttpConfig {
    /// Base path; session sub-paths are appended to it
    pub path: String,
    /// Host header value; when set the server also requires it
    pub host: String,
    /// Extra headers merged into every client request
    pub headers: HashMap<String, String>,
    /// Security layer; `None` means cleartext
    pub tls: Option<TlsConfig>,
    /// ALPN intent for cleartext carriers (`["h2"]` selects h2c)
    pub alpn: Vec<String>,
    pub max_upload_size: usize,
    pub max_concurrent_uploads: usize,
    pub session_idle_timeout_ms: u64,
    pub evict_interval_ms: u64,
    pub max_pending_segments: usize,
    pub max_pending_bytes: usize,
    pub max_ready_bytes: usize,
    pub max_reorder_window: u64,
    /// Header the server trusts to override the reported peer address
    pub trusted_forward_header: Option<String>,
    pub dial_timeout_ms: u64,
}

impl Default for SplitHttpConfig {
    fn default() -> Self {
        Self {
            path: "/".to_string(),
            host: String::new(),
            headers: HashMap::new(),
            tls: None,
            alpn: Vec::new(),
            max_upload_size: 1024 * 1024,
            max_concurrent_uploads: 10,
            session_idle_timeout_ms: 30_000,
            evict_interval_ms: 5_000,
            max_pending_segments: 64,
            max_pending_bytes: 8 * 1024 * 1024,
            max_ready_bytes: 4 * 1024 * 1024,
            max_reorder_window: 4096,
            trusted_forward_header: Some("X-Forwarded-For".to_string()),
            dial_timeout_ms: 10_000,
        }
    }
}

impl SplitHttpConfig {
    /// Config with only the base path set.
    pub fn with_path(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Base path with exactly one leading and one trailing slash.
    pub fn normalized_path(&self) -> String {
        let trimmed = self.path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    pub fn carrier(&self) -> CarrierKind {
        match &self.tls {
            Some(tls) if tls.alpn.iter().any(|p| p == "h3") => CarrierKind::H3,
            Some(_) => CarrierKind::Tls,
            None if self.alpn.len() == 1 && self.alpn[0] == "h2" => CarrierKind::H2c,
            None => CarrierKind::Http1,
        }
    }

    pub fn session_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.session_idle_timeout_ms)
    }

    pub fn evict_interval(&self) -> Duration {
        Duration::from_millis(self.evict_interval_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    /// Apply `SB_SPLITHTTP_*` environment knobs on top of the parsed values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(v) = env_usize("SB_SPLITHTTP_MAX_UPLOAD_SIZE") {
            self.max_upload_size = v;
        }
        if let Some(v) = env_usize("SB_SPLITHTTP_MAX_CONCURRENT_UPLOADS") {
            self.max_concurrent_uploads = v;
        }
    }

    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_upload_size == 0 {
            return Err(TransportError::Config("max_upload_size must be > 0".into()));
        }
        if self.max_concurrent_uploads == 0 || self.max_concurrent_uploads > MAX_CONCURRENT_UPLOADS {
            return Err(TransportError::Config(format!(
                "max_concurrent_uploads must be in 1..={MAX_CONCURRENT_UPLOADS}"
            )));
        }
        if self.max_pending_segments == 0 || self.max_pending_bytes == 0 || self.max_ready_bytes == 0
        {
            return Err(TransportError::Config("reorder limits must be > 0".into()));
        }
        if self.max_reorder_window < self.max_pending_segments as u64 {
            return Err(TransportError::Config(
                "max_reorder_window must be >= max_pending_segments".into(),
            ));
        }
        if self.session_idle_timeout_ms == 0 || self.evict_interval_ms == 0 {
            return Err(TransportError::Config("session timers must be > 0".into()));
        }
        for (name, value) in &self.headers {
            http::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Config(format!("header name {name:?}: {e}")))?;
            http::header::HeaderValue::from_str(value)
                .map_err(|e| TransportError::Config(format!("header value for {name}: {e}")))?;
        }
        if let Some(tls) = &self.tls {
            if tls.certificate_path.is_some() != tls.key_path.is_some() {
                return Err(TransportError::Config(
                    "certificate_path and key_path must be set together".into(),
                ));
            }
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// TLS settings; presence of this block selects a secured carrier.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// SNI override (client)
    pub server_name: Option<String>,
    /// Skip certificate verification (client)
    pub allow_insecure: bool,
    /// ALPN list; containing `h3` selects QUIC
    pub alpn: Vec<String>,
    /// PEM certificate chain (server)
    pub certificate_path: Option<String>,
    /// PEM private key (server)
    pub key_path: Option<String>,
    /// In-memory certificate, takes precedence over the paths
    #[serde(skip)]
    pub certificate: Option<CertificateKey>,
}

impl fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .field("allow_insecure", &self.allow_insecure)
            .field("alpn", &self.alpn)
            .field("certificate_path", &self.certificate_path)
            .field("key_path", &self.key_path)
            .field("certificate", &self.certificate.as_ref().map(|c| c.chain.len()))
            .finish()
    }
}

/// DER certificate chain plus its private key.
pub struct CertificateKey {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl CertificateKey {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { chain, key }
    }
}

impl Clone for CertificateKey {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.clone_key(),
        }
    }
}
