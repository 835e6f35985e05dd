//! TLS certificate fingerprints and the server-side TLS configuration
//!
//! The attested fingerprint is the SHA-256 of the full DER-encoded leaf
//! certificate, hex-encoded in lowercase.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::state::Generation;

/// Compute the SHA-256 fingerprint of a DER-encoded certificate
pub fn cert_fingerprint(cert_der: &[u8]) -> String {
    hex::encode(Sha256::digest(cert_der))
}

/// Pair a certificate chain with its signing key for rustls
///
/// Fails with `Error::Certificate` when the key does not belong to the leaf,
/// e.g. a renewal read between the certificate and key writes.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<Arc<CertifiedKey>> {
    if chain.is_empty() {
        return Err(Error::Tls("empty certificate chain".into()));
    }

    let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(key)
        .map_err(|e| Error::Tls(format!("Unsupported private key: {}", e)))?;

    let certified = CertifiedKey::new(chain, signing_key);
    certified
        .keys_match()
        .map_err(|e| Error::Certificate(format!("private key does not match certificate: {}", e)))?;

    Ok(Arc::new(certified))
}

/// Certificate resolver that always presents the current generation's certificate
///
/// The attestation handler reads from the same channel, so a certificate
/// swap and its attestation document are published together.
#[derive(Debug)]
pub struct GenerationCertResolver {
    current: watch::Receiver<Arc<Generation>>,
}

impl GenerationCertResolver {
    pub fn new(current: watch::Receiver<Arc<Generation>>) -> Self {
        Self { current }
    }
}

impl ResolvesServerCert for GenerationCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.current.borrow().certified_key.clone())
    }
}

/// Build the rustls server configuration (HTTP/2 and HTTP/1.1 via ALPN)
pub fn server_config(current: watch::Receiver<Arc<Generation>>) -> Arc<rustls::ServerConfig> {
    // Ensure crypto provider is installed
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(GenerationCertResolver::new(current)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Arc::new(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustls::pki_types::PrivatePkcs8KeyDer;

    #[test]
    fn test_fingerprint_format() {
        // SHA256 = 32 bytes = 64 hex chars, lowercase
        let fp = cert_fingerprint(b"certificate");
        assert_eq!(fp.len(), 64);
        assert!(fp.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c)));
        assert_eq!(
            cert_fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_certified_key_from_rcgen() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["shim.example".to_string()])
            .unwrap()
            .self_signed(&key_pair)
            .unwrap();

        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let ck = certified_key(vec![cert.der().clone()], &key).unwrap();
        assert_eq!(ck.cert[0].as_ref(), cert.der().as_ref());
    }

    #[test]
    fn test_certified_key_rejects_foreign_key() {
        let cert_key = rcgen::KeyPair::generate().unwrap();
        let cert = rcgen::CertificateParams::new(vec!["shim.example".to_string()])
            .unwrap()
            .self_signed(&cert_key)
            .unwrap();

        let other = rcgen::KeyPair::generate().unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(other.serialize_der()));
        assert!(matches!(
            certified_key(vec![cert.der().clone()], &key),
            Err(Error::Certificate(_))
        ));
    }

    #[test]
    fn test_certified_key_rejects_empty_chain() {
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        assert!(matches!(certified_key(vec![], &key), Err(Error::Tls(_))));
    }
}
