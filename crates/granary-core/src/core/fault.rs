// crates/granary-core/src/core/fault.rs
// ============================================================================
// Module: Granary Fault Taxonomy
// Description: Immutable tagged fault type for all store operations.
// Purpose: Classify driver and semantic failures once, at the DAO boundary.
// Dependencies: thiserror
// ============================================================================

//! ## Overview
//! Every store backend translates its driver errors into a [`StoreFault`]
//! exactly once and never mutates it afterwards. The retry layer inspects
//! only the [`FaultKind`] and the `retryable` flag; it never sees raw
//! driver error codes.
//!
//! Two flags ride along with the kind:
//! - `retryable` — the operation may be re-attempted after a backoff.
//! - `replay_check` — a write failed after partial execution (for
//!   example a dropped connection mid-commit) and its outcome is unknown;
//!   the caller must re-issue the write with replay detection enabled so
//!   an already-applied effect is treated as success.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;

use thiserror::Error;

// ============================================================================
// SECTION: Fault Kind
// ============================================================================

/// Classification of a store fault.
///
/// # Invariants
/// - Variants are stable for programmatic handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Connectivity or contention fault; safe to retry with backoff.
    Transient,
    /// Semantic conflict: duplicate key, already exists, CAS mismatch on
    /// a participant array. Never retried.
    Conflict,
    /// Referenced entity does not exist. Never retried.
    NotFound,
    /// Expected-state mismatch on a compare-and-swap update. Never
    /// retried.
    PreconditionFailed,
    /// This broker no longer owns the data (store being taken over).
    /// Short-circuits all retry and propagates to the broker core.
    OwnershipLost,
    /// The operation raced an exclusive activity (takeover holds the
    /// partition lock); the caller should retry later at its own pace.
    Retry,
    /// The store is closing; in-flight work is being drained.
    Closing,
    /// Unclassified failure.
    Other,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Transient => "transient",
            Self::Conflict => "conflict",
            Self::NotFound => "not found",
            Self::PreconditionFailed => "precondition failed",
            Self::OwnershipLost => "ownership lost",
            Self::Retry => "retry",
            Self::Closing => "closing",
            Self::Other => "error",
        };
        f.write_str(label)
    }
}

// ============================================================================
// SECTION: Store Fault
// ============================================================================

/// Immutable store fault carrying classification and retry metadata.
///
/// # Invariants
/// - Constructed once at the DAO boundary; fields never change afterwards.
/// - `retryable` is `true` for every `Transient` fault; other kinds opt
///   in explicitly via [`StoreFault::recoverable`].
#[derive(Debug, Clone, Error)]
#[error("store fault ({kind}): {message}")]
pub struct StoreFault {
    /// Fault classification.
    kind: FaultKind,
    /// Human-readable detail, without raw payload bytes.
    message: String,
    /// Whether the operation may be re-attempted.
    retryable: bool,
    /// Whether a re-issue must run replay detection first.
    replay_check: bool,
}

impl StoreFault {
    /// Creates a fault with an explicit kind and no retry metadata.
    #[must_use]
    pub fn new(kind: FaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: matches!(kind, FaultKind::Transient),
            replay_check: false,
        }
    }

    /// Creates a transient, retryable connectivity/contention fault.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Transient, message)
    }

    /// Creates a semantic conflict fault.
    #[must_use]
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Conflict, message)
    }

    /// Creates a not-found fault.
    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(FaultKind::NotFound, message)
    }

    /// Creates a precondition-failed (CAS mismatch) fault.
    #[must_use]
    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(FaultKind::PreconditionFailed, message)
    }

    /// Creates an ownership-lost fault (store being taken over).
    #[must_use]
    pub fn ownership_lost(message: impl Into<String>) -> Self {
        Self::new(FaultKind::OwnershipLost, message)
    }

    /// Creates a retry-later fault for operations racing an exclusive
    /// activity.
    #[must_use]
    pub fn retry_later(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Retry, message)
    }

    /// Creates a store-closing fault.
    #[must_use]
    pub fn closing(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Closing, message)
    }

    /// Creates an unclassified fault.
    #[must_use]
    pub fn other(message: impl Into<String>) -> Self {
        Self::new(FaultKind::Other, message)
    }

    /// Marks the fault recoverable (retryable) at construction time.
    ///
    /// Used by DAO write paths that rolled back cleanly after a driver
    /// failure and can safely re-execute the whole statement.
    #[must_use]
    pub const fn recoverable(mut self) -> Self {
        self.retryable = true;
        self
    }

    /// Marks the fault replay-ambiguous at construction time.
    ///
    /// Used when a write may have partially applied (rollback itself
    /// failed, or the connection dropped mid-commit); the re-issue must
    /// run replay detection.
    #[must_use]
    pub const fn with_replay_check(mut self) -> Self {
        self.replay_check = true;
        self
    }

    /// Returns the fault classification.
    #[must_use]
    pub const fn kind(&self) -> FaultKind {
        self.kind
    }

    /// Returns the human-readable detail.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Reports whether the operation may be re-attempted.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        self.retryable
    }

    /// Reports whether a re-issue must run replay detection.
    #[must_use]
    pub const fn needs_replay_check(&self) -> bool {
        self.replay_check
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_faults_are_retryable_by_default() {
        assert!(StoreFault::transient("busy").is_retryable());
        assert!(!StoreFault::conflict("dup").is_retryable());
        assert!(!StoreFault::ownership_lost("taken over").is_retryable());
    }

    #[test]
    fn recoverable_and_replay_flags_compose() {
        let fault = StoreFault::other("commit dropped").recoverable().with_replay_check();
        assert!(fault.is_retryable());
        assert!(fault.needs_replay_check());
        assert_eq!(fault.kind(), FaultKind::Other);
    }
}
