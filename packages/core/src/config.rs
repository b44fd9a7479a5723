//! Operator-facing settings of the job framework.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {name}={value}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings of one management-server process.
///
/// Every field can be overridden through a `JOBS_*` environment variable,
/// see [`FrameworkConfig::from_env`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameworkConfig {
    /// Number of worker actors per process.
    pub worker_pool_size: usize,
    /// Poll interval used when a join does not specify one.
    pub join_poll_interval: Duration,
    /// Expiration used when a join does not specify one.
    pub join_expiration: Duration,
    /// Terminal jobs older than this are expunged.
    pub job_retention: Duration,
    /// Period of the housekeeper sweep.
    pub housekeeper_interval: Duration,
    /// How often an idle worker looks for ready work.
    pub worker_poll_interval: Duration,
    /// A process whose heartbeat is older than this is considered dead.
    pub process_timeout: Duration,
    /// Waiting items older than this are reported as blocked.
    pub blocked_item_threshold: Duration,
    /// Recoveries of an orphaned job before it is failed instead.
    pub max_recovery_attempts: u32,
    /// Number of queue keys a worker inspects per poll.
    pub ready_scan_limit: usize,
}

impl Default for FrameworkConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 4,
            join_poll_interval: Duration::from_secs(1),
            join_expiration: Duration::from_secs(3_600),
            job_retention: Duration::from_secs(24 * 3_600),
            housekeeper_interval: Duration::from_secs(3),
            worker_poll_interval: Duration::from_millis(100),
            process_timeout: Duration::from_secs(30),
            blocked_item_threshold: Duration::from_secs(600),
            max_recovery_attempts: 3,
            ready_scan_limit: 64,
        }
    }
}

impl FrameworkConfig {
    pub fn with_worker_pool_size(mut self, size: usize) -> Self {
        self.worker_pool_size = size.max(1);
        self
    }

    pub fn with_join_poll_interval(mut self, interval: Duration) -> Self {
        self.join_poll_interval = interval;
        self
    }

    pub fn with_join_expiration(mut self, expiration: Duration) -> Self {
        self.join_expiration = expiration;
        self
    }

    pub fn with_job_retention(mut self, retention: Duration) -> Self {
        self.job_retention = retention;
        self
    }

    pub fn with_housekeeper_interval(mut self, interval: Duration) -> Self {
        self.housekeeper_interval = interval;
        self
    }

    pub fn with_worker_poll_interval(mut self, interval: Duration) -> Self {
        self.worker_poll_interval = interval;
        self
    }

    pub fn with_process_timeout(mut self, timeout: Duration) -> Self {
        self.process_timeout = timeout;
        self
    }

    pub fn with_blocked_item_threshold(mut self, threshold: Duration) -> Self {
        self.blocked_item_threshold = threshold;
        self
    }

    pub fn with_max_recovery_attempts(mut self, attempts: u32) -> Self {
        self.max_recovery_attempts = attempts;
        self
    }

    pub fn with_ready_scan_limit(mut self, limit: usize) -> Self {
        self.ready_scan_limit = limit.max(1);
        self
    }

    /// Build a config from environment variables.
    ///
    /// - `JOBS_WORKER_POOL_SIZE`
    /// - `JOBS_JOIN_POLL_INTERVAL_MS`
    /// - `JOBS_JOIN_EXPIRATION_MS`
    /// - `JOBS_RETENTION_SECS`
    /// - `JOBS_HOUSEKEEPER_INTERVAL_MS`
    /// - `JOBS_WORKER_POLL_INTERVAL_MS`
    /// - `JOBS_PROCESS_TIMEOUT_SECS`
    /// - `JOBS_BLOCKED_ITEM_THRESHOLD_SECS`
    /// - `JOBS_MAX_RECOVERY_ATTEMPTS`
    /// - `JOBS_READY_SCAN_LIMIT`
    ///
    /// Unset or blank variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`FrameworkConfig::from_env`], reading values through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let read = |name: &'static str| lookup(name).and_then(non_empty).map(|v| (name, v));

        Ok(Self {
            worker_pool_size: match read("JOBS_WORKER_POOL_SIZE") {
                Some((name, v)) => parse_number::<usize>(name, &v)?.max(1),
                None => defaults.worker_pool_size,
            },
            join_poll_interval: read_millis(read("JOBS_JOIN_POLL_INTERVAL_MS"))?
                .unwrap_or(defaults.join_poll_interval),
            join_expiration: read_millis(read("JOBS_JOIN_EXPIRATION_MS"))?
                .unwrap_or(defaults.join_expiration),
            job_retention: read_secs(read("JOBS_RETENTION_SECS"))?
                .unwrap_or(defaults.job_retention),
            housekeeper_interval: read_millis(read("JOBS_HOUSEKEEPER_INTERVAL_MS"))?
                .unwrap_or(defaults.housekeeper_interval),
            worker_poll_interval: read_millis(read("JOBS_WORKER_POLL_INTERVAL_MS"))?
                .unwrap_or(defaults.worker_poll_interval),
            process_timeout: read_secs(read("JOBS_PROCESS_TIMEOUT_SECS"))?
                .unwrap_or(defaults.process_timeout),
            blocked_item_threshold: read_secs(read("JOBS_BLOCKED_ITEM_THRESHOLD_SECS"))?
                .unwrap_or(defaults.blocked_item_threshold),
            max_recovery_attempts: match read("JOBS_MAX_RECOVERY_ATTEMPTS") {
                Some((name, v)) => parse_number(name, &v)?,
                None => defaults.max_recovery_attempts,
            },
            ready_scan_limit: match read("JOBS_READY_SCAN_LIMIT") {
                Some((name, v)) => parse_number::<usize>(name, &v)?.max(1),
                None => defaults.ready_scan_limit,
            },
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn parse_number<T>(name: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn read_millis(entry: Option<(&'static str, String)>) -> Result<Option<Duration>, ConfigError> {
    entry
        .map(|(name, v)| parse_number(name, &v).map(Duration::from_millis))
        .transpose()
}

fn read_secs(entry: Option<(&'static str, String)>) -> Result<Option<Duration>, ConfigError> {
    entry
        .map(|(name, v)| parse_number(name, &v).map(Duration::from_secs))
        .transpose()
}
