//! Attestation binding and document construction
//!
//! ## Binding
//! The shim ties its hardware attestation to the TLS certificate it serves:
//! - Hash the DER-encoded leaf certificate (SHA-256)
//! - Render the digest as lowercase hex text
//! - Copy that text into the 64-byte user-data field of the quote request
//!
//! A client that negotiated TLS with the shim can fetch
//! `/.well-known/tinfoil-attestation`, verify the report, and compare the
//! report's user data against the fingerprint of the certificate it saw.
//!
//! ## Provider
//! Quote generation itself is delegated to an [`AttestationProvider`]. The
//! SEV-SNP implementation lives in [`sev`].

pub mod sev;
pub mod types;

pub use types::{AttestationDocument, PredicateType, UserData, USER_DATA_SIZE};

use base64::Engine;
use tracing::{debug, warn};

use crate::error::Result;
use crate::tls;

/// Well-known path the attestation document is served under
pub const ATTESTATION_PATH: &str = "/.well-known/tinfoil-attestation";

/// Source of hardware-signed quotes
///
/// `get_quote` may block on a firmware call; async callers should run it
/// on a blocking thread.
pub trait AttestationProvider: Send + Sync {
    /// Format tag of the reports this provider returns
    fn format(&self) -> PredicateType;

    /// Largest report the platform defines; longer output is provider padding
    fn max_report_size(&self) -> usize;

    /// Request a raw quote over exactly 64 bytes of caller data
    ///
    /// Fails with `Error::ProviderUnavailable` when no backend is reachable
    /// and `Error::QuoteFailure` when the backend rejects the request.
    fn get_quote(&self, user_data: &UserData) -> Result<Vec<u8>>;
}

/// Derive the quote user data for a certificate
///
/// Deterministic: the same DER bytes always give the same buffer.
pub fn bind(cert_der: &[u8]) -> UserData {
    let fingerprint = tls::cert_fingerprint(cert_der);

    let mut data = [0u8; USER_DATA_SIZE];
    let len = fingerprint.len().min(USER_DATA_SIZE);
    data[..len].copy_from_slice(&fingerprint.as_bytes()[..len]);

    UserData(data)
}

/// Request a quote over `user_data` and wrap it in an attestation document
pub fn build_document(
    provider: &dyn AttestationProvider,
    user_data: &UserData,
) -> Result<AttestationDocument> {
    let mut report = provider.get_quote(user_data)?;

    let max = provider.max_report_size();
    if report.len() > max {
        debug!(len = report.len(), max, "truncating report to platform size");
        report.truncate(max);
    } else if report.len() < max {
        warn!(len = report.len(), max, "provider returned a short report");
    }

    Ok(AttestationDocument {
        format: provider.format(),
        body: base64::engine::general_purpose::STANDARD.encode(&report),
    })
}
