use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tinfoil_shim::config::{Cli, Command, Config, ServeArgs};
use tinfoil_shim::gate::AllowedPaths;
use tinfoil_shim::server::{self, Policies};
use tinfoil_shim::{tls, CertCache, Forwarder, Issuer, Publisher, SevGuestProvider, Verifier};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)))
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Command::Keygen) => {
            let issuer = Issuer::generate();
            println!("signing-key: {}", issuer.seed_base64());
            println!("public-key: {}", issuer.public_key_base64());
            Ok(())
        }
        Some(Command::Issue {
            signing_key,
            validity,
        }) => {
            let issuer = Issuer::from_base64(&signing_key).context("invalid signing key")?;
            println!("{}", issuer.issue(Duration::from_secs(validity)));
            Ok(())
        }
        None => serve(cli.serve).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = Config::resolve(args).context("invalid configuration")?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        domain = %config.domain,
        paths = ?config.allowed_paths,
        headers = ?config.header_names(),
        "starting SEV-SNP attestation shim"
    );

    let api_keys = config
        .api_key_public_key
        .as_deref()
        .map(Verifier::new)
        .transpose()
        .context("invalid API key public key")?;
    let forwarder = Arc::new(Forwarder::new(config.upstream_port, &config.headers)?);

    let publisher = Publisher::bootstrap(
        config.domain.clone(),
        Arc::new(CertCache::new(&config.cache_dir, config.staging)),
        Arc::new(SevGuestProvider::new()),
    )
    .await
    .context("failed to attest TLS certificate")?;
    let publisher = Arc::new(publisher);

    if let Some(interval) = config.refresh_interval {
        tokio::spawn(publisher.clone().run_refresh(interval));
    }

    let app = server::router(
        publisher.subscribe(),
        forwarder,
        Policies {
            allowed_paths: AllowedPaths::new(config.allowed_paths.clone()),
            api_keys,
        },
    );

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.listen_addr))?;
    info!("listening on {}", config.listen_addr);

    tokio::select! {
        _ = server::serve(listener, tls::server_config(publisher.subscribe()), app) => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to wait for shutdown signal")?;
            info!("shutting down");
        }
    }
    Ok(())
}
