//! TLS certificate source
//!
//! Issuance and renewal are handled outside the shim by an ACME client that
//! keeps its certificates in the certmagic storage layout:
//!
//! ```text
//! <cache>/certificates/<issuer>/<domain>/<domain>.crt
//! <cache>/certificates/<issuer>/<domain>/<domain>.key
//! ```
//!
//! The shim only reads from the cache; it never writes to it.

use der::Decode;
use fs_err as fs;
use rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use x509_cert::Certificate;

use crate::error::{Error, Result};

pub const LETS_ENCRYPT_PRODUCTION_ISSUER: &str = "acme-v02.api.letsencrypt.org-directory";
pub const LETS_ENCRYPT_STAGING_ISSUER: &str = "acme-staging-v02.api.letsencrypt.org-directory";

/// A non-empty certificate chain (leaf first) and its private key
#[derive(Debug)]
pub struct CertificateBundle {
    leaf: CertificateDer<'static>,
    intermediates: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

impl CertificateBundle {
    pub fn new(chain: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Result<Self> {
        let mut chain = chain.into_iter();
        let leaf = chain
            .next()
            .ok_or_else(|| Error::Certificate("empty certificate chain".into()))?;

        Ok(Self {
            leaf,
            intermediates: chain.collect(),
            key,
        })
    }

    /// DER bytes of the leaf certificate
    pub fn leaf(&self) -> &[u8] {
        self.leaf.as_ref()
    }

    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Full chain, leaf first, and the key
    pub fn into_parts(self) -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
        let mut chain = Vec::with_capacity(1 + self.intermediates.len());
        chain.push(self.leaf);
        chain.extend(self.intermediates);
        (chain, self.key)
    }
}

/// Supplies the live TLS certificate for a domain
pub trait CertificateSource: Send + Sync {
    fn get_certificate(&self, domain: &str) -> Result<CertificateBundle>;
}

/// Certificates maintained by an ACME client in a certmagic cache directory
#[derive(Debug, Clone)]
pub struct CertCache {
    root: PathBuf,
    staging: bool,
}

impl CertCache {
    pub fn new(root: impl Into<PathBuf>, staging: bool) -> Self {
        Self {
            root: root.into(),
            staging,
        }
    }

    fn issuer(&self) -> &'static str {
        if self.staging {
            LETS_ENCRYPT_STAGING_ISSUER
        } else {
            LETS_ENCRYPT_PRODUCTION_ISSUER
        }
    }

    /// Directory holding the certificate and key for `domain`
    pub fn site_dir(&self, domain: &str) -> PathBuf {
        self.root
            .join("certificates")
            .join(self.issuer())
            .join(safe_site_name(domain))
    }
}

impl CertificateSource for CertCache {
    fn get_certificate(&self, domain: &str) -> Result<CertificateBundle> {
        let dir = self.site_dir(domain);
        let name = safe_site_name(domain);
        debug!(dir = %dir.display(), "loading certificate from cache");

        let chain = load_chain(&dir.join(format!("{name}.crt")))?;
        let key = load_key(&dir.join(format!("{name}.key")))?;

        let bundle = CertificateBundle::new(chain, key)?;
        check_leaf(bundle.leaf(), domain)?;

        Ok(bundle)
    }
}

/// Storage-safe form of a domain name
fn safe_site_name(domain: &str) -> String {
    domain
        .trim()
        .to_lowercase()
        .replace('*', "wildcard_")
        .replace(':', "-")
}

fn read(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Certificate(e.to_string()))
}

fn load_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pems = pem::parse_many(read(path)?)
        .map_err(|e| Error::Certificate(format!("Failed to parse PEM chain: {}", e)))?;

    let chain: Vec<_> = pems
        .into_iter()
        .filter(|p| p.tag() == "CERTIFICATE")
        .map(|p| CertificateDer::from(p.into_contents()))
        .collect();

    if chain.is_empty() {
        return Err(Error::Certificate(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(chain)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pems = pem::parse_many(read(path)?)
        .map_err(|e| Error::Certificate(format!("Failed to parse PEM key: {}", e)))?;

    for p in pems {
        let key = match p.tag() {
            "PRIVATE KEY" => PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(p.into_contents())),
            "EC PRIVATE KEY" => PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(p.into_contents())),
            "RSA PRIVATE KEY" => PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(p.into_contents())),
            _ => continue,
        };
        return Ok(key);
    }

    Err(Error::Certificate(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Parse the leaf and warn when the external renewer has fallen behind
fn check_leaf(leaf_der: &[u8], domain: &str) -> Result<()> {
    let cert = Certificate::from_der(leaf_der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {}", e)))?;

    let not_after = cert.tbs_certificate.validity.not_after.to_unix_duration();
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);

    debug!(
        subject = %cert.tbs_certificate.subject,
        not_after = not_after.as_secs(),
        "parsed leaf certificate"
    );

    if not_after < now {
        warn!(domain, "cached certificate has expired");
    }
    Ok(())
}
