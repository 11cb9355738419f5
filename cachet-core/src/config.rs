//! Configuration types
//!
//! Every settings struct has sane defaults, `with_*` builders and a
//! `from_env()` reader. Values that fail to parse fall back to the default.

use crate::{CachetResult, ConfigError};
use chrono::TimeDelta;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

fn read<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

// ============================================================================
// CACHE SETTINGS
// ============================================================================

/// Eviction settings for a tagged cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Maximum number of entries. Zero or negative disables capacity eviction.
    pub max_capacity: i64,
    /// Sliding expiration in minutes. Negative disables age eviction.
    pub expiration_timeout_minutes: i64,
    /// Minimum time between two age sweeps.
    pub cleanup_interval: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 10_000,
            expiration_timeout_minutes: 30,
            cleanup_interval: Duration::from_secs(10 * 60),
        }
    }
}

impl CacheSettings {
    pub fn with_max_capacity(mut self, max_capacity: i64) -> Self {
        self.max_capacity = max_capacity;
        self
    }

    pub fn with_expiration_timeout_minutes(mut self, minutes: i64) -> Self {
        self.expiration_timeout_minutes = minutes;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Disable both eviction kinds.
    pub fn unbounded() -> Self {
        Self::default()
            .with_max_capacity(-1)
            .with_expiration_timeout_minutes(-1)
    }

    pub fn capacity_eviction_enabled(&self) -> bool {
        self.max_capacity > 0
    }

    pub fn age_eviction_enabled(&self) -> bool {
        self.expiration_timeout_minutes >= 0
    }

    /// The sliding expiration, or `None` when age eviction is disabled or the
    /// minute count does not fit a `TimeDelta`.
    pub fn expiration_timeout(&self) -> Option<TimeDelta> {
        if !self.age_eviction_enabled() {
            return None;
        }
        TimeDelta::try_minutes(self.expiration_timeout_minutes)
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `CACHET_CACHE_MAX_CAPACITY` (default: 10000)
    /// - `CACHET_CACHE_EXPIRATION_MINUTES` (default: 30)
    /// - `CACHET_CACHE_CLEANUP_INTERVAL_SECS` (default: 600)
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            max_capacity: read(&lookup, "CACHET_CACHE_MAX_CAPACITY", defaults.max_capacity),
            expiration_timeout_minutes: read(
                &lookup,
                "CACHET_CACHE_EXPIRATION_MINUTES",
                defaults.expiration_timeout_minutes,
            ),
            cleanup_interval: Duration::from_secs(read(
                &lookup,
                "CACHET_CACHE_CLEANUP_INTERVAL_SECS",
                defaults.cleanup_interval.as_secs(),
            )),
        }
    }

    pub fn validate(&self) -> CachetResult<()> {
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "cleanup_interval".to_string(),
                value: format!("{:?}", self.cleanup_interval),
                reason: "cleanup_interval must be positive".to_string(),
            }
            .into());
        }
        if self.age_eviction_enabled() && self.expiration_timeout().is_none() {
            return Err(ConfigError::InvalidValue {
                field: "expiration_timeout_minutes".to_string(),
                value: self.expiration_timeout_minutes.to_string(),
                reason: "expiration_timeout_minutes is out of range".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// REPOSITORY SETTINGS
// ============================================================================

/// Settings for the versioned store adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositorySettings {
    /// Skip version checks and upsert unconditionally. Single-writer use only.
    pub disable_optimistic_lock: bool,
    /// Operations slower than this are logged as warnings.
    pub slow_operation_threshold: Duration,
}

impl Default for RepositorySettings {
    fn default() -> Self {
        Self {
            disable_optimistic_lock: false,
            slow_operation_threshold: Duration::from_secs(5),
        }
    }
}

impl RepositorySettings {
    pub fn with_optimistic_lock_disabled(mut self, disabled: bool) -> Self {
        self.disable_optimistic_lock = disabled;
        self
    }

    pub fn with_slow_operation_threshold(mut self, threshold: Duration) -> Self {
        self.slow_operation_threshold = threshold;
        self
    }

    /// Environment variables:
    /// - `CACHET_DISABLE_OPTIMISTIC_LOCK` (default: false)
    /// - `CACHET_SLOW_OPERATION_MS` (default: 5000)
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            disable_optimistic_lock: read(
                &lookup,
                "CACHET_DISABLE_OPTIMISTIC_LOCK",
                defaults.disable_optimistic_lock,
            ),
            slow_operation_threshold: Duration::from_millis(read(
                &lookup,
                "CACHET_SLOW_OPERATION_MS",
                defaults.slow_operation_threshold.as_millis() as u64,
            )),
        }
    }

    pub fn validate(&self) -> CachetResult<()> {
        if self.slow_operation_threshold.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "slow_operation_threshold".to_string(),
                value: format!("{:?}", self.slow_operation_threshold),
                reason: "slow_operation_threshold must be positive".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// ============================================================================
// MANAGER SETTINGS
// ============================================================================

/// Fixed-delay retry policy for version mismatches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }
}

/// Manager layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerSettings {
    pub retry: RetryConfig,
    /// Maximum commands of one bulk update in flight at once.
    pub bulkhead: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            bulkhead: 10,
        }
    }
}

impl ManagerSettings {
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_bulkhead(mut self, bulkhead: usize) -> Self {
        self.bulkhead = bulkhead;
        self
    }

    /// Environment variables:
    /// - `CACHET_RETRY_MAX_RETRIES` (default: 10)
    /// - `CACHET_RETRY_DELAY_MS` (default: 100)
    /// - `CACHET_BULKHEAD` (default: 10)
    pub fn from_env() -> Self {
        Self::from_lookup(env_lookup)
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            retry: RetryConfig {
                max_retries: read(&lookup, "CACHET_RETRY_MAX_RETRIES", defaults.retry.max_retries),
                delay: Duration::from_millis(read(
                    &lookup,
                    "CACHET_RETRY_DELAY_MS",
                    defaults.retry.delay.as_millis() as u64,
                )),
            },
            bulkhead: read(&lookup, "CACHET_BULKHEAD", defaults.bulkhead),
        }
    }

    pub fn validate(&self) -> CachetResult<()> {
        if self.bulkhead == 0 {
            return Err(ConfigError::InvalidValue {
                field: "bulkhead".to_string(),
                value: "0".to_string(),
                reason: "bulkhead must be at least 1".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

// =============================================================================
// TESTS
// =============================================================================
