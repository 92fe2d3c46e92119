//! # Config: Environment-Driven Runtime Settings
//!
//! Everything the control plane needs beyond the CLI flags is read from the
//! process environment (after `dotenvy` has loaded `.env`). Unset variables fall
//! back to the defaults below; malformed values are rejected at startup rather
//! than silently replaced.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `GATEHOUSE_API_KEY` | none (minting disabled) |
//! | `TOKEN_SIGNING_KEY` | derived from the API key |
//! | `TOKEN_TTL_SECS` | 900 |
//! | `RATE_LIMIT_WINDOW_SECS` | 60 |
//! | `RATE_LIMIT_MAX_REQUESTS` | 120 |
//! | `REDIS_URL` | none (in-process limiter) |
//! | `MIN_COVERAGE_PERCENT` | 70 |
//! | `STORAGE_ENDPOINT`, `STORAGE_BUCKET`, `STORAGE_ACCESS_KEY`, `STORAGE_SECRET_KEY` | none |
//! | `STORAGE_REGION` | `us-east-1` |
//! | `PRESIGN_TTL_SECS` | 900 |
//! | `ALLOWED_CONTENT_TYPES` | json, zip, gzip, plain text, markdown, png |
//! | `AUDIT_REDACT_KEYS` | see [`crate::audit::DEFAULT_REDACT_KEYS`] |
//! | `DATABASE_MAX_CONNECTIONS` | 10 |

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::warn;

use crate::audit::DEFAULT_REDACT_KEYS;

pub const DEFAULT_ALLOWED_CONTENT_TYPES: &[&str] = &[
    "application/json",
    "application/zip",
    "application/gzip",
    "text/plain",
    "text/markdown",
    "image/png",
];

/// Connection settings for the S3-compatible artifact bucket.
#[derive(Clone, Debug, Default)]
pub struct StorageConfig {
    pub endpoint: Option<String>,
    pub bucket: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub region: String,
    pub presign_ttl: Duration,
}

#[derive(Clone, Debug)]
pub struct Config {
    /// Shared secret exchanged at `/api/v1/auth/token`. `None` disables minting.
    pub api_key: Option<String>,
    pub signing_key: Vec<u8>,
    pub token_ttl: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max_requests: u32,
    pub redis_url: Option<String>,
    pub min_coverage_percent: f64,
    pub storage: StorageConfig,
    pub allowed_content_types: Vec<String>,
    pub redact_keys: Vec<String>,
    pub database_max_connections: u32,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: None,
            signing_key: Vec::new(),
            token_ttl: Duration::from_secs(900),
            rate_limit_window: Duration::from_secs(60),
            rate_limit_max_requests: 120,
            redis_url: None,
            min_coverage_percent: 70.0,
            storage: StorageConfig {
                region: "us-east-1".to_string(),
                presign_ttl: Duration::from_secs(900),
                ..Default::default()
            },
            allowed_content_types: DEFAULT_ALLOWED_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            redact_keys: DEFAULT_REDACT_KEYS.iter().map(|s| s.to_string()).collect(),
            database_max_connections: 10,
        }
    }
}

impl Config {
    /// Build a config from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup (the environment in
    /// production, a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Config::default();
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let api_key = get("GATEHOUSE_API_KEY");
        let signing_key = match (get("TOKEN_SIGNING_KEY"), &api_key) {
            (Some(key), _) => key.into_bytes(),
            (None, Some(api_key)) => {
                warn!("TOKEN_SIGNING_KEY not set; deriving signing key from GATEHOUSE_API_KEY");
                derive_signing_key(api_key)
            }
            (None, None) => Vec::new(),
        };

        let min_coverage_percent: f64 =
            parse_or(&get, "MIN_COVERAGE_PERCENT", defaults.min_coverage_percent)?;
        if !(0.0..=100.0).contains(&min_coverage_percent) {
            anyhow::bail!(
                "MIN_COVERAGE_PERCENT must be within 0-100, got {}",
                min_coverage_percent
            );
        }

        let rate_limit_max_requests: u32 = parse_or(
            &get,
            "RATE_LIMIT_MAX_REQUESTS",
            defaults.rate_limit_max_requests,
        )?;
        if rate_limit_max_requests == 0 {
            anyhow::bail!("RATE_LIMIT_MAX_REQUESTS must be at least 1");
        }

        let storage = StorageConfig {
            endpoint: get("STORAGE_ENDPOINT"),
            bucket: get("STORAGE_BUCKET"),
            access_key: get("STORAGE_ACCESS_KEY"),
            secret_key: get("STORAGE_SECRET_KEY"),
            region: get("STORAGE_REGION").unwrap_or(defaults.storage.region),
            presign_ttl: Duration::from_secs(parse_or(&get, "PRESIGN_TTL_SECS", 900u64)?),
        };

        Ok(Config {
            api_key,
            signing_key,
            token_ttl: Duration::from_secs(parse_or(&get, "TOKEN_TTL_SECS", 900u64)?),
            rate_limit_window: Duration::from_secs(parse_or(
                &get,
                "RATE_LIMIT_WINDOW_SECS",
                60u64,
            )?),
            rate_limit_max_requests,
            redis_url: get("REDIS_URL"),
            min_coverage_percent,
            storage,
            allowed_content_types: get("ALLOWED_CONTENT_TYPES")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.allowed_content_types),
            redact_keys: get("AUDIT_REDACT_KEYS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.redact_keys),
            database_max_connections: parse_or(
                &get,
                "DATABASE_MAX_CONNECTIONS",
                defaults.database_max_connections,
            )?,
        })
    }
}

fn parse_or<T, G>(get: &G, name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn derive_signing_key(api_key: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(b"gatehouse-token-signing:");
    hasher.update(api_key.as_bytes());
    hasher.finalize().to_vec()
}
