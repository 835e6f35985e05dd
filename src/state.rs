//! Published certificate generations
//!
//! A [`Generation`] is one certificate together with the attestation document
//! bound to it. Generations are immutable; a certificate renewal produces a
//! new one that replaces the old with a single `watch` send, so readers always
//! see a matching certificate and document.

use std::sync::Arc;
use std::time::Duration;

use rustls::sign::CertifiedKey;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::attestation::{self, AttestationDocument, AttestationProvider};
use crate::cert::{CertificateBundle, CertificateSource};
use crate::error::{Error, Result};
use crate::tls;

/// A certificate and the attestation document bound to it
#[derive(Debug)]
pub struct Generation {
    /// Hex SHA-256 of the leaf certificate
    pub fingerprint: String,
    pub certified_key: Arc<CertifiedKey>,
    pub document: AttestationDocument,
}

impl Generation {
    /// Bind `bundle` to a fresh quote from `provider`
    pub fn build(bundle: CertificateBundle, provider: &dyn AttestationProvider) -> Result<Self> {
        let fingerprint = tls::cert_fingerprint(bundle.leaf());
        let user_data = attestation::bind(bundle.leaf());
        let (chain, key) = bundle.into_parts();
        // only attest a certificate that can actually be served
        let certified_key = tls::certified_key(chain, &key)?;

        info!(%fingerprint, "fetching attestation over certificate");
        let document = attestation::build_document(provider, &user_data)?;

        Ok(Self {
            fingerprint,
            certified_key,
            document,
        })
    }
}

/// Owns the current generation and rebuilds it when the certificate changes
pub struct Publisher {
    domain: String,
    source: Arc<dyn CertificateSource>,
    provider: Arc<dyn AttestationProvider>,
    current: watch::Sender<Arc<Generation>>,
}

impl Publisher {
    /// Obtain the certificate and its attestation before anything is served
    pub async fn bootstrap(
        domain: impl Into<String>,
        source: Arc<dyn CertificateSource>,
        provider: Arc<dyn AttestationProvider>,
    ) -> Result<Self> {
        let domain = domain.into();
        let generation = build_generation(&domain, &source, &provider).await?;
        let (current, _) = watch::channel(Arc::new(generation));

        Ok(Self {
            domain,
            source,
            provider,
            current,
        })
    }

    /// Receiver tracking the published generation
    pub fn subscribe(&self) -> watch::Receiver<Arc<Generation>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Arc<Generation> {
        self.current.borrow().clone()
    }

    /// Reload the certificate and republish if it changed
    ///
    /// Returns whether a new generation was published. On error the
    /// previous generation stays in place.
    pub async fn refresh(&self) -> Result<bool> {
        let source = self.source.clone();
        let domain = self.domain.clone();
        let bundle = tokio::task::spawn_blocking(move || source.get_certificate(&domain))
            .await
            .map_err(join_error)??;

        let fingerprint = tls::cert_fingerprint(bundle.leaf());
        if fingerprint == self.current.borrow().fingerprint {
            debug!(%fingerprint, "certificate unchanged");
            return Ok(false);
        }

        info!(%fingerprint, "certificate changed, rebinding attestation");
        let provider = self.provider.clone();
        let generation =
            tokio::task::spawn_blocking(move || Generation::build(bundle, provider.as_ref()))
                .await
                .map_err(join_error)??;

        self.current.send_replace(Arc::new(generation));
        Ok(true)
    }

    /// Periodically check for a renewed certificate
    pub async fn run_refresh(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = self.refresh().await {
                error!("attestation refresh failed, keeping current document: {}", e);
            }
        }
    }
}

async fn build_generation(
    domain: &str,
    source: &Arc<dyn CertificateSource>,
    provider: &Arc<dyn AttestationProvider>,
) -> Result<Generation> {
    let source = source.clone();
    let provider = provider.clone();
    let domain = domain.to_string();

    tokio::task::spawn_blocking(move || {
        let bundle = source.get_certificate(&domain)?;
        Generation::build(bundle, provider.as_ref())
    })
    .await
    .map_err(join_error)?
}

fn join_error(e: tokio::task::JoinError) -> Error {
    Error::Io(std::io::Error::other(e))
}
