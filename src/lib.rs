//! # Tinfoil Attestation Shim
//!
//! TLS-terminating front end for a workload running inside an AMD SEV-SNP
//! confidential VM.
//!
//! ## Certificate Binding
//!
//! At startup the shim:
//! - Loads the domain's TLS certificate from the ACME client's cache
//! - Computes the SHA-256 fingerprint of the leaf certificate
//! - Requests a hardware attestation report carrying that fingerprint
//!   as user data
//!
//! The report is published at `/.well-known/tinfoil-attestation`. A client
//! that verifies the report and compares its user data with the certificate
//! it negotiated knows it is talking to the attested enclave.
//!
//! ## Request Path
//!
//! Every other request goes through the configured access policies
//! (path allow-list, signed API keys) and is then proxied to the workload
//! on `127.0.0.1`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tinfoil_shim::{server, tls, CertCache, Forwarder, Publisher, SevGuestProvider};
//!
//! let publisher = Publisher::bootstrap(
//!     "inference.example.com",
//!     Arc::new(CertCache::new("/var/lib/certmagic", false)),
//!     Arc::new(SevGuestProvider::new()),
//! )
//! .await?;
//!
//! let app = server::router(
//!     publisher.subscribe(),
//!     Arc::new(Forwarder::new(8080, &[])?),
//!     server::Policies::default(),
//! );
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:443").await?;
//! server::serve(listener, tls::server_config(publisher.subscribe()), app).await;
//! ```

pub mod attestation;
pub mod cert;
pub mod config;
pub mod error;
pub mod gate;
pub mod key;
pub mod proxy;
pub mod server;
pub mod state;
pub mod tls;

pub use attestation::sev::SevGuestProvider;
pub use attestation::{AttestationDocument, AttestationProvider, PredicateType};
pub use cert::{CertCache, CertificateSource};
pub use config::Config;
pub use error::Error;
pub use key::{Issuer, KeyError, Verifier};
pub use proxy::Forwarder;
pub use state::{Generation, Publisher};
