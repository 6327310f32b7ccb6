// crates/granary-store/src/retry.rs
// ============================================================================
// Module: Retry Strategy
// Description: Bounded retry combinator for DAO operations.
// Purpose: Classify caught faults and either sleep-and-retry or re-raise.
// Dependencies: granary-core, crate::config, crate::pool
// ============================================================================

//! ## Overview
//! Every state-mutating facade method runs as a retry loop: execute the
//! operation, and on a fault ask the strategy whether to re-attempt. The
//! strategy retries only faults marked retryable, sleeps a doubling
//! backoff between attempts (aborting early when the store is closing),
//! and re-raises the FIRST fault once attempts are exhausted so the
//! caller sees the original failure, not the last symptom.
//!
//! Ownership-lost faults short-circuit everything: a broker that has
//! lost its store must stop serving, not retry.
//!
//! The strategy also propagates the replay-check flag: when a fault says
//! a write may have partially applied, the next attempt runs with replay
//! detection enabled so an already-applied effect is treated as success.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use granary_core::FaultKind;
use granary_core::LogEvent;
use granary_core::LogSink;
use granary_core::Severity;
use granary_core::StoreFault;

use crate::config::RetryPolicy;
use crate::pool::DbPool;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Sleep slice used while backing off, so closing aborts promptly.
const SLEEP_SLICE: Duration = Duration::from_millis(100);

// ============================================================================
// SECTION: Strategy
// ============================================================================

/// Per-operation retry state.
///
/// # Invariants
/// - The first fault observed is the one re-raised on exhaustion.
/// - The backoff delay doubles after every attempt.
pub struct RetryStrategy<'a> {
    /// Pool whose closing flag aborts backoff sleeps.
    pool: &'a DbPool,
    /// Logging sink for retry events.
    log: &'a Arc<dyn LogSink>,
    /// Attempt/delay bounds.
    policy: RetryPolicy,
    /// Attempts consumed so far.
    attempts: u32,
    /// Next backoff delay.
    delay: Duration,
    /// First fault observed.
    first_fault: Option<StoreFault>,
}

impl<'a> RetryStrategy<'a> {
    /// Creates a fresh strategy for one logical operation.
    #[must_use]
    pub fn new(pool: &'a DbPool, log: &'a Arc<dyn LogSink>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            log,
            policy,
            attempts: 0,
            delay: policy.initial_delay(),
            first_fault: None,
        }
    }

    /// Decides whether the caught fault should be retried.
    ///
    /// Returns the replay-check flag for the next attempt on `Ok`.
    ///
    /// # Errors
    ///
    /// Re-raises the first observed fault when the caught fault is not
    /// retryable, the store is closing, or attempts are exhausted.
    /// Ownership-lost faults are re-raised immediately, untouched.
    pub fn assert_should_retry(&mut self, fault: StoreFault) -> Result<bool, StoreFault> {
        if fault.kind() == FaultKind::OwnershipLost {
            self.log.log(
                LogEvent::new(Severity::Error, "store.ownership_lost", fault.message().to_string()),
            );
            return Err(fault);
        }
        let replay = fault.needs_replay_check();
        let retryable = fault.is_retryable();
        let first = self.first_fault.get_or_insert(fault);
        if self.pool.is_closing() {
            return Err(StoreFault::closing(format!("store closing during retry: {}", first.message())));
        }
        if !retryable || self.attempts >= self.policy.max_attempts {
            return Err(first.clone());
        }
        self.attempts += 1;
        self.log.log(
            LogEvent::new(Severity::Info, "store.retry", first.message().to_string())
                .with("attempt", self.attempts.to_string())
                .with("delay_ms", self.delay.as_millis().to_string()),
        );
        let mut remaining = self.delay;
        while !remaining.is_zero() {
            if self.pool.is_closing() {
                return Err(StoreFault::closing(format!(
                    "store closing during retry: {}",
                    first.message()
                )));
            }
            let slice = remaining.min(SLEEP_SLICE);
            thread::sleep(slice);
            remaining = remaining.saturating_sub(slice);
        }
        self.delay = self.delay.saturating_mul(2);
        Ok(replay)
    }
}

// ============================================================================
// SECTION: Combinator
// ============================================================================

/// Runs `op` under the retry policy, threading the replay-check flag.
///
/// The closure receives `true` when the previous attempt failed with a
/// replay-ambiguous fault and must run replay detection.
///
/// # Errors
///
/// Returns the first fault once retries are exhausted, or immediately
/// for non-retryable faults.
pub fn run<T>(
    pool: &DbPool,
    log: &Arc<dyn LogSink>,
    policy: RetryPolicy,
    mut op: impl FnMut(bool) -> Result<T, StoreFault>,
) -> Result<T, StoreFault> {
    let mut strategy = RetryStrategy::new(pool, log, policy);
    let mut replay = false;
    loop {
        match op(replay) {
            Ok(value) => return Ok(value),
            Err(fault) => {
                replay = strategy.assert_should_retry(fault)? || replay;
            }
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use granary_core::MemoryLogSink;

    use super::*;
    use crate::config::StoreConfig;

    fn test_pool() -> DbPool {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_path(dir.path().join("retry.db"));
        DbPool::open(&config).unwrap()
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1,
        }
    }

    #[test]
    fn conflict_is_never_retried() {
        let pool = test_pool();
        let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        let mut calls = 0_u32;
        let result: Result<(), StoreFault> = run(&pool, &log, fast_policy(5), |_| {
            calls += 1;
            Err(StoreFault::conflict("duplicate"))
        });
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().kind(), FaultKind::Conflict);
    }

    #[test]
    fn transient_retries_until_bound_and_raises_first_fault() {
        let pool = test_pool();
        let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        let mut calls = 0_u32;
        let result: Result<(), StoreFault> = run(&pool, &log, fast_policy(3), |_| {
            calls += 1;
            Err(StoreFault::transient(format!("busy {calls}")))
        });
        assert_eq!(calls, 4);
        assert_eq!(result.unwrap_err().message(), "busy 1");
    }

    #[test]
    fn transient_then_success_returns_value() {
        let pool = test_pool();
        let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        let mut calls = 0_u32;
        let result = run(&pool, &log, fast_policy(5), |_| {
            calls += 1;
            if calls < 3 {
                Err(StoreFault::transient("busy"))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn ownership_lost_short_circuits() {
        let pool = test_pool();
        let sink = Arc::new(MemoryLogSink::new());
        let log: Arc<dyn LogSink> = Arc::clone(&sink) as Arc<dyn LogSink>;
        let mut calls = 0_u32;
        let result: Result<(), StoreFault> = run(&pool, &log, fast_policy(5), |_| {
            calls += 1;
            Err(StoreFault::ownership_lost("store being taken over"))
        });
        assert_eq!(calls, 1);
        assert_eq!(result.unwrap_err().kind(), FaultKind::OwnershipLost);
        assert!(sink.has_code("store.ownership_lost"));
    }

    #[test]
    fn replay_flag_reaches_next_attempt() {
        let pool = test_pool();
        let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        let mut saw_replay = false;
        let mut calls = 0_u32;
        let result = run(&pool, &log, fast_policy(5), |replay| {
            calls += 1;
            if calls == 1 {
                Err(StoreFault::transient("dropped mid-commit").with_replay_check())
            } else {
                saw_replay = replay;
                Ok(())
            }
        });
        assert!(result.is_ok());
        assert!(saw_replay);
    }

    #[test]
    fn closing_pool_aborts_retry() {
        let pool = test_pool();
        let log: Arc<dyn LogSink> = Arc::new(MemoryLogSink::new());
        pool.set_closing();
        let result: Result<(), StoreFault> = run(&pool, &log, fast_policy(5), |_| {
            Err(StoreFault::transient("busy"))
        });
        assert_eq!(result.unwrap_err().kind(), FaultKind::Closing);
    }
}
