//! Core types for attestation publishing

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Size of the caller-supplied data field bound into a hardware quote
pub const USER_DATA_SIZE: usize = 64;

/// Predicate types for different attestation formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PredicateType {
    /// Raw SEV-SNP report, base64 encoded (what this shim publishes)
    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v1")]
    SevGuestV1,

    #[serde(rename = "https://tinfoil.sh/predicate/sev-snp-guest/v2")]
    SevGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/tdx-guest/v2")]
    TdxGuestV2,

    #[serde(rename = "https://tinfoil.sh/predicate/snp-tdx-multiplatform/v1")]
    SnpTdxMultiPlatformV1,

    #[serde(other)]
    Unknown,
}

/// Attestation document served at `/.well-known/tinfoil-attestation`
///
/// Built once per certificate generation and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttestationDocument {
    pub format: PredicateType,
    pub body: String, // Base64-encoded raw report
}

impl AttestationDocument {
    /// Serialize to the two-field JSON object clients expect
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Fixed-size buffer handed to the attestation provider
///
/// The leading bytes hold the lowercase hex text of the certificate
/// fingerprint (ASCII, not the decoded digest); the rest is zero.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub [u8; USER_DATA_SIZE]);

impl UserData {
    pub fn as_bytes(&self) -> &[u8; USER_DATA_SIZE] {
        &self.0
    }
}

impl std::fmt::Debug for UserData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UserData").field(&hex::encode(self.0)).finish()
    }
}

impl AsRef<[u8]> for UserData {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
