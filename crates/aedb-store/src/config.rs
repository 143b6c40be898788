// ABOUTME: Store configuration loaded from environment variables with defaults.
// ABOUTME: Controls SQLite busy timeout, tail polling and the time base of newly created stores.

use std::time::Duration;

use aedb_core::TimeBase;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tail::{Follow, TailOptions};

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} is not a valid {expected}: {value:?}")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Settings shared by every handle opened with them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    pub busy_timeout: Duration,
    pub poll_interval: Duration,
    pub tail_buffer: usize,
    pub tail_max_retries: u32,
    pub time_base: TimeBase,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_millis(5000),
            poll_interval: Duration::from_millis(100),
            tail_buffer: 1000,
            tail_max_retries: 5,
            time_base: TimeBase::DEFAULT,
        }
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var).filter(|v| !v.trim().is_empty()) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                var,
                expected,
                value,
            }),
    }
}

impl StoreConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - AEDB_BUSY_TIMEOUT_MS: SQLite busy timeout (default: 5000)
    /// - AEDB_POLL_INTERVAL_MS: tail poll interval (default: 100)
    /// - AEDB_TAIL_BUFFER: rows fetched per tail poll (default: 1000)
    /// - AEDB_TAIL_MAX_RETRIES: consecutive failed polls tolerated (default: 5)
    /// - AEDB_TIME_BASE: ticks per second for new stores (default: 10000000)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`StoreConfig::from_env`] with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let busy_timeout = parse::<u64>(&lookup, "AEDB_BUSY_TIMEOUT_MS", "number of milliseconds")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.busy_timeout);

        let poll_interval = parse::<u64>(&lookup, "AEDB_POLL_INTERVAL_MS", "number of milliseconds")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval);

        let tail_buffer = match parse::<usize>(&lookup, "AEDB_TAIL_BUFFER", "positive row count")? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    var: "AEDB_TAIL_BUFFER",
                    expected: "positive row count",
                    value: "0".to_string(),
                });
            }
            Some(n) => n,
            None => defaults.tail_buffer,
        };

        let tail_max_retries = parse::<u32>(&lookup, "AEDB_TAIL_MAX_RETRIES", "retry count")?
            .unwrap_or(defaults.tail_max_retries);

        let time_base = match parse::<u64>(&lookup, "AEDB_TIME_BASE", "positive tick rate")? {
            Some(ticks) => TimeBase::new(ticks).ok_or(ConfigError::Invalid {
                var: "AEDB_TIME_BASE",
                expected: "positive tick rate",
                value: ticks.to_string(),
            })?,
            None => defaults.time_base,
        };

        Ok(Self {
            busy_timeout,
            poll_interval,
            tail_buffer,
            tail_max_retries,
            time_base,
        })
    }

    /// Tail options that follow the store forever, starting at the current end.
    pub fn tail_options(&self) -> TailOptions {
        TailOptions {
            start_after: None,
            poll_interval: self.poll_interval,
            buffer_size: self.tail_buffer,
            max_retries: self.tail_max_retries,
            follow: Follow::Forever,
        }
    }
}
