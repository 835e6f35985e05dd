//! Error types for the Tinfoil shim

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Attestation provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Quote request failed: {0}")]
    QuoteFailure(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid verification public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid signing key: {0}")]
    InvalidSigningKey(String),

    #[error("Upstream request failed: {0}")]
    Proxy(#[from] reqwest::Error),

    #[error("JSON encoding failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
