// crates/granary-core/src/core/state.rs
// ============================================================================
// Module: Granary State Machines
// Description: Delivery, transaction, and broker lifecycle state enums.
// Purpose: Provide stable integer wire forms for persisted state columns.
// Dependencies: serde
// ============================================================================

//! ## Overview
//! Persisted state columns use stable integer codes so a store written by
//! one broker version can be read by another. Conversions are total in the
//! encode direction and checked in the decode direction; unknown codes are
//! surfaced to the caller rather than mapped to a default.
//!
//! The broker state machine is the heart of the HA takeover protocol: a
//! takeover flips the target through `FailoverPending` or directly to
//! `FailoverStarted`, then `FailoverComplete` on success or
//! `FailoverFailed` on compensation.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

// ============================================================================
// SECTION: Delivery State
// ============================================================================

/// Per-consumer delivery progress for one message.
///
/// # Invariants
/// - Wire codes are stable: `Routed` = 0, `Delivered` = 1,
///   `Acknowledged` = 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Message routed to the consumer but not yet handed out.
    Routed,
    /// Message delivered to the consumer, acknowledgement pending.
    Delivered,
    /// Consumer acknowledged the message.
    Acknowledged,
}

impl DeliveryState {
    /// Returns the stable persisted code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Routed => 0,
            Self::Delivered => 1,
            Self::Acknowledged => 2,
        }
    }

    /// Decodes a persisted code, returning `None` for unknown values.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Routed),
            1 => Some(Self::Delivered),
            2 => Some(Self::Acknowledged),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Transaction State
// ============================================================================

/// Lifecycle state of a persisted transaction.
///
/// # Invariants
/// - Wire codes are stable and match the historical store layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Transaction record created.
    Created,
    /// Transaction started by the session layer.
    Started,
    /// Transaction failed.
    Failed,
    /// Transaction has incomplete participants.
    Incomplete,
    /// All participants reported complete.
    Complete,
    /// Transaction prepared (first phase of 2PC).
    Prepared,
    /// Transaction committed.
    Committed,
    /// Transaction rolled back.
    Rolledback,
    /// Transaction expired before completion.
    TimedOut,
}

impl TransactionState {
    /// Returns the stable persisted code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Created => 0,
            Self::Started => 1,
            Self::Failed => 2,
            Self::Incomplete => 3,
            Self::Complete => 4,
            Self::Prepared => 5,
            Self::Committed => 6,
            Self::Rolledback => 7,
            Self::TimedOut => 8,
        }
    }

    /// Decodes a persisted code, returning `None` for unknown values.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Created),
            1 => Some(Self::Started),
            2 => Some(Self::Failed),
            3 => Some(Self::Incomplete),
            4 => Some(Self::Complete),
            5 => Some(Self::Prepared),
            6 => Some(Self::Committed),
            7 => Some(Self::Rolledback),
            8 => Some(Self::TimedOut),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Transaction Type
// ============================================================================

/// Scope of a persisted transaction.
///
/// # Invariants
/// - `Cluster` and `Remote` transactions always carry either a home
///   broker or a non-empty participant list, never both inconsistently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    /// Transaction local to one broker.
    Local,
    /// Cluster transaction spanning several brokers.
    Cluster,
    /// Transaction homed on a remote broker.
    Remote,
}

impl TransactionType {
    /// Returns the stable persisted code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Local => 1,
            Self::Cluster => 2,
            Self::Remote => 3,
        }
    }

    /// Decodes a persisted code, returning `None` for unknown values.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Local),
            2 => Some(Self::Cluster),
            3 => Some(Self::Remote),
            _ => None,
        }
    }
}

// ============================================================================
// SECTION: Broker State
// ============================================================================

/// Lifecycle state of a broker row, including the takeover sub-machine.
///
/// # Invariants
/// - Takeover transitions are monotonic: once another broker has moved
///   the row into a `Failover*` state, the previous owner must not apply
///   further updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BrokerState {
    /// Broker is initializing its store.
    Initializing,
    /// Broker is serving normally.
    Operating,
    /// Broker started quiescing.
    QuiesceStarted,
    /// Broker finished quiescing.
    QuiesceComplete,
    /// Broker shutdown started.
    ShutdownStarted,
    /// Broker shutdown finished.
    ShutdownComplete,
    /// Another broker has flagged this one for failover.
    FailoverPending,
    /// A surviving broker acquired the takeover lock.
    FailoverStarted,
    /// Takeover finished; the target's sessions have a new owner.
    FailoverComplete,
    /// Takeover failed and the target row was restored.
    FailoverFailed,
}

impl BrokerState {
    /// Returns the stable persisted code.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Initializing => 0,
            Self::Operating => 1,
            Self::QuiesceStarted => 2,
            Self::QuiesceComplete => 3,
            Self::ShutdownStarted => 4,
            Self::ShutdownComplete => 5,
            Self::FailoverPending => 6,
            Self::FailoverStarted => 7,
            Self::FailoverComplete => 8,
            Self::FailoverFailed => 9,
        }
    }

    /// Decodes a persisted code, returning `None` for unknown values.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Initializing),
            1 => Some(Self::Operating),
            2 => Some(Self::QuiesceStarted),
            3 => Some(Self::QuiesceComplete),
            4 => Some(Self::ShutdownStarted),
            5 => Some(Self::ShutdownComplete),
            6 => Some(Self::FailoverPending),
            7 => Some(Self::FailoverStarted),
            8 => Some(Self::FailoverComplete),
            9 => Some(Self::FailoverFailed),
            _ => None,
        }
    }

    /// Reports whether this state marks an in-progress or finished takeover.
    #[must_use]
    pub const fn is_failover(self) -> bool {
        matches!(
            self,
            Self::FailoverPending | Self::FailoverStarted | Self::FailoverComplete | Self::FailoverFailed
        )
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_state_codes_round_trip() {
        for state in [DeliveryState::Routed, DeliveryState::Delivered, DeliveryState::Acknowledged] {
            assert_eq!(DeliveryState::from_code(state.code()), Some(state));
        }
        assert_eq!(DeliveryState::from_code(99), None);
    }

    #[test]
    fn broker_state_failover_classification() {
        assert!(BrokerState::FailoverStarted.is_failover());
        assert!(BrokerState::FailoverFailed.is_failover());
        assert!(!BrokerState::Operating.is_failover());
    }

    #[test]
    fn transaction_codes_are_stable() {
        assert_eq!(TransactionState::Committed.code(), 6);
        assert_eq!(TransactionType::Remote.code(), 3);
        assert_eq!(TransactionState::from_code(5), Some(TransactionState::Prepared));
    }
}
