//! Command line and configuration file handling
//!
//! Values are resolved once at startup, highest precedence first:
//! flags (or their `TINFOIL_SHIM_*` environment variables), the YAML file
//! given with `--config`, the `tinfoil-domain` kernel parameter (domain
//! only), then built-in defaults.

use clap::{ArgAction, Args, Parser, Subcommand};
use fs_err as fs;
use serde::Deserialize;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const KERNEL_CMDLINE: &str = "/proc/cmdline";
pub const DOMAIN_PARAM: &str = "tinfoil-domain";

pub const DEFAULT_LISTEN_ADDR: &str = ":443";
pub const DEFAULT_UPSTREAM_PORT: u16 = 8080;
pub const DEFAULT_REFRESH_INTERVAL: u64 = 3600;

#[derive(Parser, Debug)]
#[command(name = "tinfoil-shim", version, about = "SEV-SNP attestation shim")]
#[command(args_conflicts_with_subcommands = true)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub serve: ServeArgs,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate an API key signing key and print it with its public key
    Keygen,

    /// Issue an API key
    Issue {
        /// URL-safe base64 signing key seed, as printed by `keygen`
        #[arg(long, env = "TINFOIL_SHIM_SIGNING_KEY", hide_env_values = true)]
        signing_key: String,

        /// Validity window in seconds
        #[arg(long, default_value_t = 86400)]
        validity: u64,
    },
}

#[derive(Args, Debug, Default, Clone)]
pub struct ServeArgs {
    /// YAML configuration file
    #[arg(short = 'c', long, env = "TINFOIL_SHIM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Domain to serve (default: tinfoil-domain kernel parameter)
    #[arg(long, env = "TINFOIL_SHIM_DOMAIN")]
    pub domain: Option<String>,

    /// Listen address
    #[arg(short = 'l', long = "listen", env = "TINFOIL_SHIM_LISTEN")]
    pub listen_addr: Option<String>,

    /// Use the staging CA
    #[arg(short = 's', long, env = "TINFOIL_SHIM_STAGING")]
    pub staging: bool,

    /// Upstream port on 127.0.0.1
    #[arg(short = 'u', long = "upstream", env = "TINFOIL_SHIM_UPSTREAM")]
    pub upstream_port: Option<u16>,

    /// Comma-separated paths to proxy to the upstream (all if empty)
    #[arg(short = 'p', long = "paths", env = "TINFOIL_SHIM_PATHS")]
    pub allowed_paths: Option<String>,

    /// Comma-separated Key:Value headers to add upstream
    #[arg(short = 'H', long, env = "TINFOIL_SHIM_HEADERS", hide_env_values = true)]
    pub headers: Option<String>,

    /// certmagic certificate cache
    #[arg(long, env = "TINFOIL_SHIM_CACHE_DIR")]
    pub cache_dir: Option<PathBuf>,

    /// URL-safe base64 Ed25519 public key; enables API key checks
    #[arg(long, env = "TINFOIL_SHIM_API_KEY_PUBLIC_KEY")]
    pub api_key_public_key: Option<String>,

    /// Seconds between certificate renewal checks (0 disables)
    #[arg(long, env = "TINFOIL_SHIM_REFRESH_INTERVAL")]
    pub refresh_interval: Option<u64>,
}

/// On-disk configuration, every field optional
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct FileConfig {
    domain: Option<String>,
    listen_addr: Option<String>,
    staging: Option<bool>,
    upstream_port: Option<u16>,
    allowed_paths: Option<Vec<String>>,
    headers: Option<Vec<String>>,
    cache_dir: Option<PathBuf>,
    api_key_public_key: Option<String>,
    refresh_interval: Option<u64>,
}

/// Resolved startup configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub domain: String,
    /// `host:port`, with an empty host already replaced
    pub listen_addr: String,
    pub staging: bool,
    pub upstream_port: u16,
    pub allowed_paths: Vec<String>,
    pub headers: Vec<(String, String)>,
    pub cache_dir: PathBuf,
    pub api_key_public_key: Option<String>,
    pub refresh_interval: Option<Duration>,
}

impl Config {
    pub fn resolve(args: ServeArgs) -> Result<Self> {
        Self::resolve_with(args, Path::new(KERNEL_CMDLINE))
    }

    /// Resolve reading the domain fallback from `cmdline`
    pub fn resolve_with(args: ServeArgs, cmdline: &Path) -> Result<Self> {
        let file = match &args.config {
            Some(path) => {
                let raw = fs::read_to_string(path)?;
                serde_yaml::from_str::<FileConfig>(&raw)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            }
            None => FileConfig::default(),
        };

        let domain = match args.domain.or(file.domain) {
            Some(domain) => domain,
            None => cmdline_param(&fs::read_to_string(cmdline)?, DOMAIN_PARAM)
                .ok_or_else(|| Error::Config(format!("missing {DOMAIN_PARAM}")))?,
        };
        if domain.is_empty() {
            return Err(Error::Config("empty domain".into()));
        }

        let listen_addr = parse_listen_addr(
            args.listen_addr
                .or(file.listen_addr)
                .as_deref()
                .unwrap_or(DEFAULT_LISTEN_ADDR),
        )?;

        let allowed_paths = match args.allowed_paths {
            Some(paths) => parse_paths(&paths),
            None => file
                .allowed_paths
                .unwrap_or_default()
                .into_iter()
                .filter(|p| !p.is_empty())
                .collect(),
        };

        let headers = match args.headers {
            Some(headers) => parse_headers(&headers)?,
            None => file
                .headers
                .unwrap_or_default()
                .iter()
                .map(|pair| parse_header(pair))
                .collect::<Result<_>>()?,
        };

        let cache_dir = match args.cache_dir.or(file.cache_dir) {
            Some(dir) => dir,
            None => default_cache_dir(std::env::var_os("XDG_DATA_HOME"), std::env::var_os("HOME"))
                .ok_or_else(|| Error::Config("cannot determine certificate cache directory".into()))?,
        };

        let refresh_interval = match args
            .refresh_interval
            .or(file.refresh_interval)
            .unwrap_or(DEFAULT_REFRESH_INTERVAL)
        {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            domain,
            listen_addr,
            staging: args.staging || file.staging.unwrap_or(false),
            upstream_port: args
                .upstream_port
                .or(file.upstream_port)
                .unwrap_or(DEFAULT_UPSTREAM_PORT),
            allowed_paths,
            headers,
            cache_dir,
            api_key_public_key: args.api_key_public_key.or(file.api_key_public_key),
            refresh_interval,
        })
    }

    /// Configured header names, for logging without values
    pub fn header_names(&self) -> Vec<&str> {
        self.headers.iter().map(|(k, _)| k.as_str()).collect()
    }
}

/// Value of `key=value` on a kernel command line
pub fn cmdline_param(cmdline: &str, key: &str) -> Option<String> {
    cmdline.split_whitespace().find_map(|p| {
        p.strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
            .map(str::to_string)
    })
}

/// Accept `host:port` or `:port` (all interfaces)
pub fn parse_listen_addr(addr: &str) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| Error::Config(format!("listen address {addr:?} has no port")))?;
    port.parse::<u16>()
        .map_err(|_| Error::Config(format!("invalid port in listen address {addr:?}")))?;

    if host.is_empty() {
        Ok(format!("0.0.0.0:{port}"))
    } else {
        Ok(addr.to_string())
    }
}

pub fn parse_paths(paths: &str) -> Vec<String> {
    paths
        .split(',')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_headers(headers: &str) -> Result<Vec<(String, String)>> {
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    headers.split(',').map(parse_header).collect()
}

fn parse_header(pair: &str) -> Result<(String, String)> {
    let mut parts = pair.split(':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(name), Some(value), None) => Ok((name.to_string(), value.to_string())),
        _ => Err(Error::Config(format!("invalid header: {pair}"))),
    }
}

fn default_cache_dir(xdg_data_home: Option<OsString>, home: Option<OsString>) -> Option<PathBuf> {
    match xdg_data_home.filter(|d| !d.is_empty()) {
        Some(dir) => Some(PathBuf::from(dir).join("certmagic")),
        None => home
            .filter(|d| !d.is_empty())
            .map(|home| PathBuf::from(home).join(".local/share/certmagic")),
    }
}
