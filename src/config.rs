use crate::services::accounting::AccountingSettings;
use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// 32 MiB: large enough for most mod jars, small enough that modpacks stream through.
const DEFAULT_MAX_CACHEABLE_BYTES: u64 = 32 * 1024 * 1024;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub bucket: String,
    pub cache_capacity: usize,
    pub max_cacheable_bytes: u64,
    pub drain_timeout: Duration,
    pub accounting: AccountingSettings,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Edge content-delivery handler")]
pub struct Args {
    /// Host to bind to (overrides CDN_EDGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides CDN_EDGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where object payloads live (overrides CDN_EDGE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Metadata database URL (overrides CDN_EDGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Bucket to serve objects from (overrides CDN_EDGE_BUCKET)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Base URL of the API that counts downloads (overrides LABRINTH_URL)
    #[arg(long)]
    pub labrinth_url: Option<String>,

    /// Header carrying the client address (overrides CDN_EDGE_CLIENT_IP_HEADER)
    #[arg(long)]
    pub client_ip_header: Option<String>,

    /// Maximum number of cached responses (overrides CDN_EDGE_CACHE_CAPACITY)
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Largest object, in bytes, kept in the response cache (overrides CDN_EDGE_MAX_CACHEABLE_BYTES)
    #[arg(long)]
    pub max_cacheable_bytes: Option<u64>,

    /// Seconds to wait for background work on shutdown (overrides CDN_EDGE_DRAIN_TIMEOUT_SECS)
    #[arg(long)]
    pub drain_timeout_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        Self::resolve(Args::parse(), |name| env::var(name))
    }

    /// Merge CLI args over values from `lookup` over defaults.
    fn resolve(
        args: Args,
        lookup: impl Fn(&str) -> Result<String, env::VarError>,
    ) -> Result<(Self, bool)> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|_| default.into());

        let env_port = parse_var(&lookup, "CDN_EDGE_PORT", 3000)?;
        let env_capacity = parse_var(&lookup, "CDN_EDGE_CACHE_CAPACITY", 1024)?;
        let env_max_cacheable =
            parse_var(&lookup, "CDN_EDGE_MAX_CACHEABLE_BYTES", DEFAULT_MAX_CACHEABLE_BYTES)?;
        let env_drain = parse_var(&lookup, "CDN_EDGE_DRAIN_TIMEOUT_SECS", 10)?;
        let accounting_timeout = parse_var(&lookup, "CDN_EDGE_ACCOUNTING_TIMEOUT_SECS", 10)?;

        let cfg = Self {
            host: args.host.unwrap_or_else(|| var("CDN_EDGE_HOST", "0.0.0.0")),
            port: args.port.unwrap_or(env_port),
            storage_dir: args
                .storage_dir
                .unwrap_or_else(|| var("CDN_EDGE_STORAGE_DIR", "./data/objects")),
            database_url: args.database_url.unwrap_or_else(|| {
                var("CDN_EDGE_DATABASE_URL", "sqlite://./data/meta/cdn_edge.db")
            }),
            bucket: args.bucket.unwrap_or_else(|| var("CDN_EDGE_BUCKET", "cdn")),
            cache_capacity: args.cache_capacity.unwrap_or(env_capacity),
            max_cacheable_bytes: args.max_cacheable_bytes.unwrap_or(env_max_cacheable),
            drain_timeout: Duration::from_secs(args.drain_timeout_secs.unwrap_or(env_drain)),
            accounting: AccountingSettings {
                base_url: args
                    .labrinth_url
                    .unwrap_or_else(|| var("LABRINTH_URL", "http://localhost:8000")),
                admin_key: var("LABRINTH_ADMIN_KEY", ""),
                rate_limit_key: var("RATE_LIMIT_IGNORE_KEY", ""),
                client_ip_header: args
                    .client_ip_header
                    .unwrap_or_else(|| var("CDN_EDGE_CLIENT_IP_HEADER", "CF-Connecting-IP")),
                timeout: Duration::from_secs(accounting_timeout),
            },
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Result<String, env::VarError>,
    name: &str,
    default: T,
) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
