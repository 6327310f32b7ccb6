// crates/granary-store/src/config.rs
// ============================================================================
// Module: Store Configuration
// Description: Deserializable configuration for the SQLite-backed store.
// Purpose: Validate pool sizing, retry bounds, and partition settings at
//          construction time.
// Dependencies: serde, thiserror
// ============================================================================

//! ## Overview
//! Configuration is built by the owning process (broker composition root
//! or the `granary-dbmgr` front end) and passed into the store at
//! construction; there is no global configuration access. Defaults follow
//! the historical store: unbounded-feeling retry for regular operations,
//! a ~30s/4-attempt bound for heartbeat updates, and ~60s/5 attempts for
//! broker state transitions.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Default busy timeout for `SQLite` connections (ms).
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;
/// Default connection pool size.
const DEFAULT_POOL_SIZE: usize = 4;
/// Default retry attempt bound for regular operations.
const DEFAULT_RETRY_ATTEMPTS: u32 = 12;
/// Default initial retry delay (ms).
const DEFAULT_RETRY_DELAY_MS: u64 = 2_000;
/// Heartbeat retry attempt bound (tight: stale heartbeats are replaced).
const HEARTBEAT_RETRY_ATTEMPTS: u32 = 4;
/// Heartbeat initial retry delay (ms), ~30s total under doubling.
const HEARTBEAT_RETRY_DELAY_MS: u64 = 2_000;
/// State-transition retry attempt bound.
const STATE_RETRY_ATTEMPTS: u32 = 5;
/// State-transition initial retry delay (ms), ~60s total under doubling.
const STATE_RETRY_DELAY_MS: u64 = 2_000;

// ============================================================================
// SECTION: Errors
// ============================================================================

/// Configuration validation errors.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A numeric limit was out of range.
    #[error("store config invalid: {0}")]
    Invalid(String),
}

// ============================================================================
// SECTION: Retry Policy
// ============================================================================

/// Bounded-retry policy consumed by the retry strategy.
///
/// # Invariants
/// - `max_attempts` >= 1; `initial_delay` > 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetryPolicy {
    /// Maximum retry attempts before the first fault is re-raised.
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds; doubles per attempt.
    pub initial_delay_ms: u64,
}

impl RetryPolicy {
    /// Default policy for regular store operations.
    #[must_use]
    pub const fn default_ops() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_delay_ms: DEFAULT_RETRY_DELAY_MS,
        }
    }

    /// Tight policy for heartbeat updates.
    #[must_use]
    pub const fn heartbeat() -> Self {
        Self {
            max_attempts: HEARTBEAT_RETRY_ATTEMPTS,
            initial_delay_ms: HEARTBEAT_RETRY_DELAY_MS,
        }
    }

    /// Policy for broker state transitions.
    #[must_use]
    pub const fn state_transition() -> Self {
        Self {
            max_attempts: STATE_RETRY_ATTEMPTS,
            initial_delay_ms: STATE_RETRY_DELAY_MS,
        }
    }

    /// Returns the initial delay as a [`Duration`].
    #[must_use]
    pub const fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_ops()
    }
}

// ============================================================================
// SECTION: Store Config
// ============================================================================

/// Configuration for the SQLite-backed store.
///
/// # Invariants
/// - `path` must resolve to a file path (not a directory).
/// - `pool_size` >= 1.
/// - Partition mode requires HA-style session relocation support and is
///   only honored when the owning identity enables it.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the `SQLite` database file.
    pub path: PathBuf,
    /// Busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Number of pooled connections.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
    /// Retry policy for regular operations.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Whether this broker runs the store in partitioned mode.
    #[serde(default)]
    pub partition_mode: bool,
    /// Whether partitions may migrate off this broker.
    #[serde(default)]
    pub partition_migratable: bool,
    /// Whether tables are created implicitly at first open.
    #[serde(default = "default_create_tables")]
    pub create_tables: bool,
}

/// Returns the default busy timeout.
const fn default_busy_timeout_ms() -> u64 {
    DEFAULT_BUSY_TIMEOUT_MS
}

/// Returns the default pool size.
const fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

/// Returns the default implicit-create flag.
const fn default_create_tables() -> bool {
    true
}

impl StoreConfig {
    /// Creates a config with defaults for the given database path.
    #[must_use]
    pub fn for_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_size: default_pool_size(),
            retry: RetryPolicy::default_ops(),
            partition_mode: false,
            partition_migratable: false,
            create_tables: default_create_tables(),
        }
    }

    /// Validates limits.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when a limit is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size == 0 {
            return Err(ConfigError::Invalid("pool_size must be greater than zero".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be greater than zero".to_string(),
            ));
        }
        if self.retry.initial_delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms must be greater than zero".to_string(),
            ));
        }
        if self.partition_migratable && !self.partition_mode {
            return Err(ConfigError::Invalid(
                "partition_migratable requires partition_mode".to_string(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = StoreConfig::for_path("/tmp/granary.db");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_pool_size_rejected() {
        let mut config = StoreConfig::for_path("/tmp/granary.db");
        config.pool_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn migratable_requires_partition_mode() {
        let mut config = StoreConfig::for_path("/tmp/granary.db");
        config.partition_migratable = true;
        assert!(config.validate().is_err());
        config.partition_mode = true;
        assert!(config.validate().is_ok());
    }
}
