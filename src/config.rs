//! Server configuration loaded from environment variables.
//!
//! Every setting comes from a `KENNEL_*` variable (or a `.env` file via
//! `dotenvy`). Unset variables fall back to defaults; set-but-invalid ones
//! are an error.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::engine::{EngineOptions, StoreRetry};
use crate::limits::MAX_PENDING_TTL_SECS;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key}: invalid value {value:?}")]
    Invalid { key: &'static str, value: String },
    #[error("{key} must be at least 1")]
    Zero { key: &'static str },
    #[error("{key} must be at most {max}")]
    OutOfRange { key: &'static str, max: u64 },
}

/// Top-level server configuration, loaded once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KennelConfig {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a rewrite.
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub status_retry_attempts: u32,
    pub retry_backoff: Duration,
    pub store_retry_attempts: u32,
    /// PENDING bookings older than this are cancelled. `None` disables expiry.
    pub pending_ttl: Option<Duration>,
    pub metrics_port: Option<u16>,
}

impl Default for KennelConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 7878,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(2000),
            status_retry_attempts: 3,
            retry_backoff: Duration::from_millis(10),
            store_retry_attempts: 3,
            pending_ttl: None,
            metrics_port: None,
        }
    }
}

impl KennelConfig {
    /// Load `.env` if present, then read the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let lock_timeout_ms: u64 = parse_env(&lookup, "KENNEL_LOCK_TIMEOUT_MS", 2000)?;
        let retry_backoff_ms: u64 = parse_env(&lookup, "KENNEL_RETRY_BACKOFF_MS", 10)?;
        let pending_ttl_secs: Option<u64> = parse_opt(&lookup, "KENNEL_PENDING_TTL_SECS")?;

        let config = Self {
            bind: lookup("KENNEL_BIND").unwrap_or(defaults.bind),
            port: parse_env(&lookup, "KENNEL_PORT", defaults.port)?,
            data_dir: lookup("KENNEL_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            max_connections: parse_env(&lookup, "KENNEL_MAX_CONNECTIONS", defaults.max_connections)?,
            compact_threshold: parse_env(&lookup, "KENNEL_COMPACT_THRESHOLD", defaults.compact_threshold)?,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            status_retry_attempts: parse_env(
                &lookup,
                "KENNEL_STATUS_RETRY_ATTEMPTS",
                defaults.status_retry_attempts,
            )?,
            retry_backoff: Duration::from_millis(retry_backoff_ms),
            store_retry_attempts: parse_env(
                &lookup,
                "KENNEL_STORE_RETRY_ATTEMPTS",
                defaults.store_retry_attempts,
            )?,
            pending_ttl: pending_ttl_secs.map(Duration::from_secs),
            metrics_port: parse_opt(&lookup, "KENNEL_METRICS_PORT")?,
        };

        if config.max_connections == 0 {
            return Err(ConfigError::Zero { key: "KENNEL_MAX_CONNECTIONS" });
        }
        if config.status_retry_attempts == 0 {
            return Err(ConfigError::Zero { key: "KENNEL_STATUS_RETRY_ATTEMPTS" });
        }
        if config.store_retry_attempts == 0 {
            return Err(ConfigError::Zero { key: "KENNEL_STORE_RETRY_ATTEMPTS" });
        }
        if pending_ttl_secs.is_some_and(|secs| secs > MAX_PENDING_TTL_SECS) {
            return Err(ConfigError::OutOfRange {
                key: "KENNEL_PENDING_TTL_SECS",
                max: MAX_PENDING_TTL_SECS,
            });
        }
        Ok(config)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kennel.wal")
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            wal_path: self.wal_path(),
            lock_timeout: self.lock_timeout,
            status_retry_attempts: self.status_retry_attempts,
            retry_backoff: self.retry_backoff,
            store_retry: StoreRetry {
                attempts: self.store_retry_attempts,
                ..StoreRetry::default()
            },
        }
    }

    pub fn metrics_addr(&self) -> Option<SocketAddr> {
        self.metrics_port.map(|port| ([0, 0, 0, 0], port).into())
    }
}

/// `default` when unset, error when set to something unparsable.
fn parse_env<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}
