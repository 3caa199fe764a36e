//! Throwaway certificates for tests.

use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

/// DER chain and PKCS#8 key for a self-signed certificate valid for `name`.
pub fn self_signed(name: &str) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("generate self-signed certificate");
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    (vec![certified.cert.der().clone()], key.into())
}

/// PEM encoded `(certificate, private key)` for file-based configuration tests.
pub fn self_signed_pem(name: &str) -> (String, String) {
    let certified = rcgen::generate_simple_self_signed(vec![name.to_string()])
        .expect("generate self-signed certificate");
    (certified.cert.pem(), certified.key_pair.serialize_pem())
}
