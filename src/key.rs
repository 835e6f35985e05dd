//! Signed, time-limited API keys
//!
//! An API key is URL-safe base64 (no padding) of a fixed 96-byte layout:
//!
//! ```text
//! nonce (16) || issued_at (8, BE secs) || validity (8, BE secs) || ed25519 signature (64)
//! ```
//!
//! The signature covers everything before it. Verification needs only the
//! issuer's public key and the clock; no server-side state is kept.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::error::{Error, Result};

pub const NONCE_SIZE: usize = 16;
pub const TIMESTAMP_SIZE: usize = 8;
pub const VALIDITY_SIZE: usize = 8;
pub const SIGNATURE_SIZE: usize = 64;
pub const MESSAGE_SIZE: usize = NONCE_SIZE + TIMESTAMP_SIZE + VALIDITY_SIZE;
pub const TOTAL_SIZE: usize = MESSAGE_SIZE + SIGNATURE_SIZE;

/// Reasons an API key is rejected, checked in declaration order
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyError {
    #[error("invalid API key format")]
    InvalidFormat,

    #[error("invalid API key length")]
    InvalidLength,

    #[error("API key expired")]
    Expired,

    #[error("invalid API key signature")]
    InvalidSignature,
}

/// Stateless API key verifier
#[derive(Debug, Clone)]
pub struct Verifier {
    public_key: VerifyingKey,
}

impl Verifier {
    /// Create a verifier from a URL-safe base64 Ed25519 public key
    pub fn new(public_key: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(public_key.trim())?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| Error::InvalidPublicKey(format!("expected 32 bytes, got {}", b.len())))?;
        let public_key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| Error::InvalidPublicKey(e.to_string()))?;

        Ok(Self { public_key })
    }

    pub fn from_key(public_key: VerifyingKey) -> Self {
        Self { public_key }
    }

    /// Check an API key is signed and not expired
    pub fn verify(&self, api_key: &str) -> std::result::Result<(), KeyError> {
        self.verify_at(api_key, unix_now())
    }

    /// Verify against an explicit clock (seconds since the Unix epoch)
    ///
    /// A key issued in the future is not rejected: elapsed time saturates
    /// at zero, which never exceeds the validity window.
    pub fn verify_at(&self, api_key: &str, now: u64) -> std::result::Result<(), KeyError> {
        let data = URL_SAFE_NO_PAD
            .decode(api_key)
            .map_err(|_| KeyError::InvalidFormat)?;
        if data.len() != TOTAL_SIZE {
            return Err(KeyError::InvalidLength);
        }

        let (message, signature) = data.split_at(MESSAGE_SIZE);
        let issued_at = read_u64(&message[NONCE_SIZE..NONCE_SIZE + TIMESTAMP_SIZE]);
        let validity = read_u64(&message[NONCE_SIZE + TIMESTAMP_SIZE..]);

        // equal to the window is still valid
        if now.saturating_sub(issued_at) > validity {
            return Err(KeyError::Expired);
        }

        let signature =
            Signature::from_slice(signature).map_err(|_| KeyError::InvalidSignature)?;
        self.public_key
            .verify(message, &signature)
            .map_err(|_| KeyError::InvalidSignature)
    }
}

/// API key issuer holding the Ed25519 signing key
pub struct Issuer {
    signing_key: SigningKey,
}

impl Issuer {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    /// Load from a URL-safe base64 32-byte seed
    pub fn from_base64(seed: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD.decode(seed.trim())?;
        let seed: [u8; 32] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| Error::InvalidSigningKey(format!("expected 32 bytes, got {}", b.len())))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&seed)))
    }

    /// URL-safe base64 of the signing key seed
    pub fn seed_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.to_bytes())
    }

    /// URL-safe base64 of the public key, as accepted by [`Verifier::new`]
    pub fn public_key_base64(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.signing_key.verifying_key().to_bytes())
    }

    pub fn verifier(&self) -> Verifier {
        Verifier::from_key(self.signing_key.verifying_key())
    }

    /// Issue a key valid from now for `validity`
    pub fn issue(&self, validity: Duration) -> String {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);
        self.issue_at(nonce, unix_now(), validity.as_secs())
    }

    pub fn issue_at(&self, nonce: [u8; NONCE_SIZE], issued_at: u64, validity_secs: u64) -> String {
        let mut data = Vec::with_capacity(TOTAL_SIZE);
        data.extend_from_slice(&nonce);
        data.extend_from_slice(&issued_at.to_be_bytes());
        data.extend_from_slice(&validity_secs.to_be_bytes());

        let signature = self.signing_key.sign(&data);
        data.extend_from_slice(&signature.to_bytes());

        URL_SAFE_NO_PAD.encode(data)
    }
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_be_bytes(buf)
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}
