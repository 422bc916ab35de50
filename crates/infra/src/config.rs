//! Ledger and sweeper configuration.
//!
//! Loads from environment variables with defaults for anything unset. A set
//! but unparsable variable is an error rather than a silent fallback.

use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::retry::{BackoffStrategy, RetryPolicy};

pub const LOCK_TIMEOUT_MS_VAR: &str = "STOCK_LEDGER_LOCK_TIMEOUT_MS";
pub const MAX_RETRIES_VAR: &str = "STOCK_LEDGER_MAX_RETRIES";
pub const RETRY_BASE_DELAY_MS_VAR: &str = "STOCK_LEDGER_RETRY_BASE_DELAY_MS";
pub const RETRY_BACKOFF_VAR: &str = "STOCK_LEDGER_RETRY_BACKOFF";
pub const SWEEP_INTERVAL_SECS_VAR: &str = "STOCK_LEDGER_SWEEP_INTERVAL_SECS";
pub const SWEEP_BATCH_SIZE_VAR: &str = "STOCK_LEDGER_SWEEP_BATCH_SIZE";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Settings for `StockLedger`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Longest wait for a per-stock lock before giving up with a retryable error
    pub lock_timeout: Duration,
    /// Backoff applied to version conflicts and lock timeouts
    pub retry: RetryPolicy,
    /// Outbox rows re-published per `flush_outbox` call
    pub outbox_batch_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            outbox_batch_size: 256,
        }
    }
}

impl LedgerConfig {
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    /// Like `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(ms) = parse_var::<u64>(&lookup, LOCK_TIMEOUT_MS_VAR)? {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(retries) = parse_var::<u32>(&lookup, MAX_RETRIES_VAR)? {
            config.retry.max_retries = retries;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, RETRY_BASE_DELAY_MS_VAR)? {
            config.retry.base_delay = Duration::from_millis(ms);
            config.retry.max_delay = config.retry.max_delay.max(config.retry.base_delay);
        }
        if let Some(strategy) = parse_var::<BackoffStrategy>(&lookup, RETRY_BACKOFF_VAR)? {
            config.retry.strategy = strategy;
        }
        Ok(config)
    }
}

/// Settings for the reservation expiry sweeper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweeperConfig {
    /// Pause between sweeps
    pub interval: Duration,
    /// Expired reservations handled per sweep
    pub batch_size: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            batch_size: 500,
        }
    }
}

impl SweeperConfig {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = parse_var::<u64>(&lookup, SWEEP_INTERVAL_SECS_VAR)? {
            if secs == 0 {
                return Err(invalid(SWEEP_INTERVAL_SECS_VAR, "0", "must be at least 1"));
            }
            config.interval = Duration::from_secs(secs);
        }
        if let Some(size) = parse_var::<usize>(&lookup, SWEEP_BATCH_SIZE_VAR)? {
            if size == 0 {
                return Err(invalid(SWEEP_BATCH_SIZE_VAR, "0", "must be at least 1"));
            }
            config.batch_size = size;
        }
        Ok(config)
    }
}

fn parse_var<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: core::fmt::Display,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse()
        .map(Some)
        .map_err(|e: T::Err| invalid(var, trimmed, e.to_string()))
}

fn invalid(var: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.into(),
    }
}
