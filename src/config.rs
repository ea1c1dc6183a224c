//! Configuration for deferkv
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

use crate::dirty::Priority;
use crate::error::{CacheError, Result};

/// Main configuration for a write-back cache instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Flush Configuration
    // -------------------------------------------------------------------------
    /// Period between automatic flush cycles
    pub flush_interval: Duration,

    /// Max dirty entries drained per cycle
    pub flush_batch_size: usize,

    /// Failed attempts tolerated before a key is escalated to dead-letter
    pub max_retries: u32,

    /// Upper bound on a single `Database::batch_set` call
    pub flush_timeout: Duration,

    /// Backoff after the first failure of a key; doubles per failure
    pub retry_backoff_base: Duration,

    /// Backoff ceiling
    pub retry_backoff_max: Duration,

    /// Priority assigned by `set` (vs. `set_with_priority`)
    pub default_priority: Priority,

    /// Most recent dead letters kept for the shutdown report
    pub dead_letter_history: usize,

    // -------------------------------------------------------------------------
    // Durable Log Configuration
    // -------------------------------------------------------------------------
    /// Whether `set` synchronously appends to the durable log
    pub durability_enabled: bool,

    /// Durable log file
    pub log_path: PathBuf,

    /// Sync strategy: how often to fsync the log
    pub wal_sync_strategy: WalSyncStrategy,

    /// Log size (bytes) above which the flush coordinator compacts it
    pub log_compact_threshold: u64,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalSyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync after N uncommitted entries (an acknowledged write may be lost on crash)
    EveryNEntries { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            flush_batch_size: 100,
            max_retries: 5,
            flush_timeout: Duration::from_secs(5),
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_max: Duration::from_secs(30),
            default_priority: Priority::MEDIUM,
            dead_letter_history: 1024,
            durability_enabled: true,
            log_path: PathBuf::from("./deferkv_data/deferkv.wal"),
            wal_sync_strategy: WalSyncStrategy::EveryWrite,
            log_compact_threshold: 16 * 1024 * 1024, // 16 MB
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Reject settings that would stall the flush coordinator
    pub fn validate(&self) -> Result<()> {
        if self.flush_batch_size == 0 {
            return Err(CacheError::Config("flush_batch_size must be > 0".to_string()));
        }
        if self.flush_interval.is_zero() {
            return Err(CacheError::Config("flush_interval must be > 0".to_string()));
        }
        if self.flush_timeout.is_zero() {
            return Err(CacheError::Config("flush_timeout must be > 0".to_string()));
        }
        if let WalSyncStrategy::EveryNEntries { count: 0 } = self.wal_sync_strategy {
            return Err(CacheError::Config(
                "EveryNEntries count must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Backoff to apply after a key's `retry_count`-th failure
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let shift = retry_count.saturating_sub(1).min(16);
        self.retry_backoff_base
            .saturating_mul(1u32 << shift)
            .min(self.retry_backoff_max)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the period between automatic flush cycles
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    /// Set the max entries drained per cycle
    pub fn flush_batch_size(mut self, size: usize) -> Self {
        self.config.flush_batch_size = size;
        self
    }

    /// Set the retry budget before dead-lettering
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    /// Set the database call timeout
    pub fn flush_timeout(mut self, timeout: Duration) -> Self {
        self.config.flush_timeout = timeout;
        self
    }

    /// Set the backoff base and ceiling
    pub fn retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.retry_backoff_base = base;
        self.config.retry_backoff_max = max;
        self
    }

    /// Set the priority used by `set`
    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.config.default_priority = priority;
        self
    }

    /// Set how many dead letters are kept for the shutdown report
    pub fn dead_letter_history(mut self, len: usize) -> Self {
        self.config.dead_letter_history = len;
        self
    }

    /// Enable or disable the durable log
    pub fn durability_enabled(mut self, enabled: bool) -> Self {
        self.config.durability_enabled = enabled;
        self
    }

    /// Set the durable log file path
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_path = path.into();
        self
    }

    /// Set the log sync strategy
    pub fn wal_sync_strategy(mut self, strategy: WalSyncStrategy) -> Self {
        self.config.wal_sync_strategy = strategy;
        self
    }

    /// Set the compaction threshold (in bytes)
    pub fn log_compact_threshold(mut self, bytes: u64) -> Self {
        self.config.log_compact_threshold = bytes;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
