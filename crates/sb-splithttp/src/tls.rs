//! # TLS 材料模块 / TLS material
//!
//! 基于 rustls 构建客户端与服务端配置：
//! - 客户端：webpki 根证书或 `allow_insecure` 时跳过验证，SNI 与 ALPN
//! - 服务端：内存证书或 PEM 文件，TCP 默认 ALPN `h2`,`http/1.1`，QUIC 为 `h3`
//! - `TlsDialer`：在已建立的流上完成客户端 TLS 握手
//!
//! The ring provider is selected explicitly so the process-wide default
//! provider never has to be installed.

use crate::config::{CertificateKey, TlsConfig};
use crate::dialer::IoStream;
use crate::error::TransportError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::sync::Arc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

pub const ALPN_H2: &[u8] = b"h2";
pub const ALPN_HTTP11: &[u8] = b"http/1.1";
pub const ALPN_H3: &[u8] = b"h3";

fn provider() -> Arc<rustls::crypto::CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn alpn_bytes(list: &[String]) -> Vec<Vec<u8>> {
    list.iter().map(|p| p.as_bytes().to_vec()).collect()
}

/// Client configuration for TCP+TLS; ALPN defaults to `h2`,`http/1.1`.
pub fn client_config(tls: &TlsConfig) -> Result<rustls::ClientConfig, TransportError> {
    let alpn = if tls.alpn.is_empty() {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        alpn_bytes(&tls.alpn)
    };
    build_client(tls, alpn, false)
}

/// Client configuration for QUIC; TLS 1.3 only, ALPN `h3`.
pub fn quic_client_config(tls: &TlsConfig) -> Result<rustls::ClientConfig, TransportError> {
    build_client(tls, vec![ALPN_H3.to_vec()], true)
}

fn build_client(
    tls: &TlsConfig,
    alpn: Vec<Vec<u8>>,
    tls13_only: bool,
) -> Result<rustls::ClientConfig, TransportError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider());
    let builder = if tls13_only {
        builder.with_protocol_versions(&[&rustls::version::TLS13])
    } else {
        builder.with_safe_default_protocol_versions()
    }
    .map_err(TransportError::tls)?;

    let mut config = if tls.allow_insecure {
        debug!("tls certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    } else {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        builder.with_root_certificates(roots).with_no_client_auth()
    };
    config.alpn_protocols = alpn;
    Ok(config)
}

/// Server configuration for TCP+TLS.
pub fn server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig, TransportError> {
    let alpn = if tls.alpn.is_empty() {
        vec![ALPN_H2.to_vec(), ALPN_HTTP11.to_vec()]
    } else {
        alpn_bytes(&tls.alpn)
    };
    build_server(tls, alpn, false)
}

/// Server configuration for QUIC.
pub fn quic_server_config(tls: &TlsConfig) -> Result<rustls::ServerConfig, TransportError> {
    build_server(tls, vec![ALPN_H3.to_vec()], true)
}

fn build_server(
    tls: &TlsConfig,
    alpn: Vec<Vec<u8>>,
    tls13_only: bool,
) -> Result<rustls::ServerConfig, TransportError> {
    let cert = load_certificate(tls)?;
    let builder = rustls::ServerConfig::builder_with_provider(provider());
    let builder = if tls13_only {
        builder.with_protocol_versions(&[&rustls::version::TLS13])
    } else {
        builder.with_safe_default_protocol_versions()
    }
    .map_err(TransportError::tls)?;
    let mut config = builder
        .with_no_client_auth()
        .with_single_cert(cert.chain, cert.key)
        .map_err(TransportError::tls)?;
    config.alpn_protocols = alpn;
    Ok(config)
}

/// In-memory certificate first, then the PEM paths.
pub fn load_certificate(tls: &TlsConfig) -> Result<CertificateKey, TransportError> {
    if let Some(cert) = &tls.certificate {
        return Ok(cert.clone());
    }
    let (Some(cert_path), Some(key_path)) = (&tls.certificate_path, &tls.key_path) else {
        return Err(TransportError::Config(
            "server tls requires a certificate".into(),
        ));
    };

    let cert_pem = std::fs::read(cert_path)?;
    let chain = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<Result<Vec<CertificateDer<'static>>, _>>()?;
    if chain.is_empty() {
        return Err(TransportError::Config(format!(
            "no certificates in {cert_path}"
        )));
    }

    let key_pem = std::fs::read(key_path)?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| TransportError::Config(format!("no private key in {key_path}")))?;

    Ok(CertificateKey::new(chain, key))
}

/// TLS 客户端握手器
///
/// Runs the client handshake over a stream the carrier already connected,
/// so the TCP addresses stay observable to the caller.
pub struct TlsDialer {
    pub config: Arc<rustls::ClientConfig>,
    pub sni_override: Option<String>,
}

impl TlsDialer {
    pub fn new(config: rustls::ClientConfig, sni_override: Option<String>) -> Self {
        Self {
            config: Arc::new(config),
            sni_override,
        }
    }

    /// Client handshake; the typed stream exposes the negotiated ALPN.
    pub async fn handshake(
        &self,
        stream: IoStream,
        host: &str,
    ) -> Result<TlsStream<IoStream>, TransportError> {
        let sni_host = self.sni_override.as_deref().unwrap_or(host);
        let server_name = ServerName::try_from(sni_host.to_string())
            .map_err(|e| TransportError::Tls(format!("invalid server name {sni_host}: {e}")))?;
        let connector = TlsConnector::from(self.config.clone());
        let tls = connector
            .connect(server_name, stream)
            .await
            .map_err(TransportError::tls)?;
        debug!(
            host = sni_host,
            alpn = ?tls.get_ref().1.alpn_protocol().map(String::from_utf8_lossy),
            "tls handshake complete"
        );
        Ok(tls)
    }
}

/// Certificate verifier that accepts any server certificate.
///
/// Only installed when `allow_insecure: true` is configured.
#[derive(Debug)]
pub struct NoVerify;

impl ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_default_alpn() {
        let tls = TlsConfig {
            allow_insecure: true,
            ..Default::default()
        };
        let config = client_config(&tls).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);

        let quic = quic_client_config(&tls).unwrap();
        assert_eq!(quic.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn test_server_config_requires_certificate() {
        let err = server_config(&TlsConfig::default()).unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_server_config_from_memory() {
        let (chain, key) = sb_test_utils::tls::self_signed("localhost");
        let tls = TlsConfig {
            certificate: Some(CertificateKey::new(chain, key)),
            ..Default::default()
        };
        let config = server_config(&tls).unwrap();
        assert_eq!(config.alpn_protocols.len(), 2);
        let quic = quic_server_config(&tls).unwrap();
        assert_eq!(quic.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn test_missing_pem_file_is_io_error() {
        let tls = TlsConfig {
            certificate_path: Some("/nonexistent/cert.pem".into()),
            key_path: Some("/nonexistent/key.pem".into()),
            ..Default::default()
        };
        assert!(matches!(load_certificate(&tls), Err(TransportError::Io(_))));
    }

    #[test]
    fn test_load_certificate_from_pem_files() {
        let (cert_pem, key_pem) = sb_test_utils::tls::self_signed_pem("localhost");
        let dir = std::env::temp_dir().join(format!("sb-splithttp-pem-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");
        std::fs::write(&cert_path, cert_pem).unwrap();
        std::fs::write(&key_path, key_pem).unwrap();

        let tls = TlsConfig {
            certificate_path: Some(cert_path.to_string_lossy().into_owned()),
            key_path: Some(key_path.to_string_lossy().into_owned()),
            ..Default::default()
        };
        let loaded = load_certificate(&tls).unwrap();
        assert_eq!(loaded.chain.len(), 1);
        assert!(server_config(&tls).is_ok());

        // a key file is not a certificate file
        let swapped = TlsConfig {
            certificate_path: tls.key_path.clone(),
            key_path: tls.key_path.clone(),
            ..Default::default()
        };
        assert!(matches!(load_certificate(&swapped), Err(TransportError::Config(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
