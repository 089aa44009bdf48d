//! Environment driven configuration for the operator and the backup handler

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handler::api::MAX_BATCH_LIMIT;

/// Default location of the job database inside the backup handler pod
pub const DEFAULT_DATABASE_PATH: &str = "/var/backup-handler/backup.db";

/// Port the coordination API listens on
pub const DEFAULT_HANDLER_PORT: u16 = 8890;

/// Default metrics port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Backup handler settings
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerConfig {
    /// SQLite file backing the job store
    pub database_path: PathBuf,
    /// Address the coordination API binds to
    pub listen_addr: SocketAddr,
    /// Base URL the dispatch loop uses to reach the coordination API
    pub api_url: String,
    /// Directory archives are written to
    pub archive_dir: PathBuf,
    /// Delay before the first dispatch cycle
    pub startup_delay: Duration,
    /// Sleep between dispatch cycles
    pub poll_interval: Duration,
    /// Maximum jobs fetched per cycle
    pub batch_size: u32,
    /// Port for /metrics, /healthz and /readyz
    pub metrics_port: u16,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_HANDLER_PORT)),
            api_url: format!("http://localhost:{}", DEFAULT_HANDLER_PORT),
            archive_dir: PathBuf::from("/tmp"),
            startup_delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(3),
            batch_size: 5,
            metrics_port: DEFAULT_METRICS_PORT,
        }
    }
}

impl HandlerConfig {
    /// Build from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();

        // The is-running flag is only a hint, so two dispatchers would race on
        // the same batch.
        let replicas: u32 = parse_var(&lookup, "BACKUP_HANDLER_REPLICAS", 1)?;
        if replicas != 1 {
            return Err(Error::config(format!(
                "BACKUP_HANDLER_REPLICAS must be 1, got {}: dispatch is single-replica only",
                replicas
            )));
        }

        let batch_size = parse_var(&lookup, "BACKUP_HANDLER_BATCH_SIZE", defaults.batch_size)?;
        if batch_size == 0 {
            return Err(Error::config("BACKUP_HANDLER_BATCH_SIZE must be at least 1"));
        }
        if batch_size > MAX_BATCH_LIMIT {
            return Err(Error::config(format!(
                "BACKUP_HANDLER_BATCH_SIZE must be at most {}, got {}",
                MAX_BATCH_LIMIT, batch_size
            )));
        }

        Ok(Self {
            database_path: lookup("BACKUP_HANDLER_DB")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            listen_addr: parse_var(&lookup, "BACKUP_HANDLER_LISTEN", defaults.listen_addr)?,
            api_url: lookup("BACKUP_HANDLER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.api_url),
            archive_dir: lookup("BACKUP_HANDLER_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.archive_dir),
            startup_delay: Duration::from_secs(parse_var(
                &lookup,
                "BACKUP_HANDLER_STARTUP_DELAY_SECS",
                defaults.startup_delay.as_secs(),
            )?),
            poll_interval: Duration::from_secs(parse_var(
                &lookup,
                "BACKUP_HANDLER_POLL_INTERVAL_SECS",
                defaults.poll_interval.as_secs(),
            )?),
            batch_size,
            metrics_port: parse_var(
                &lookup,
                "BACKUP_HANDLER_METRICS_PORT",
                defaults.metrics_port,
            )?,
        })
    }
}

/// Operator settings
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Base URL of the backup handler's coordination API
    pub handler_url: String,
    /// Port for /metrics, /healthz and /readyz
    pub metrics_port: u16,
    /// Requeue interval while a job is in flight
    pub requeue_interval: Duration,
    /// Requeue interval while the restore destination still has pods
    pub pods_running_requeue: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            handler_url: format!("http://localhost:{}", DEFAULT_HANDLER_PORT),
            metrics_port: DEFAULT_METRICS_PORT,
            requeue_interval: Duration::from_secs(3),
            pods_running_requeue: Duration::from_secs(2),
        }
    }
}

impl OperatorConfig {
    /// Build from process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            handler_url: lookup("BACKUP_HANDLER_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.handler_url),
            metrics_port: parse_var(&lookup, "OPERATOR_METRICS_PORT", defaults.metrics_port)?,
            requeue_interval: Duration::from_secs(parse_var(
                &lookup,
                "OPERATOR_REQUEUE_SECS",
                defaults.requeue_interval.as_secs(),
            )?),
            pods_running_requeue: Duration::from_secs(parse_var(
                &lookup,
                "OPERATOR_PODS_RUNNING_REQUEUE_SECS",
                defaults.pods_running_requeue.as_secs(),
            )?),
        })
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value '{}' for {}: {}", raw, key, e))),
    }
}
