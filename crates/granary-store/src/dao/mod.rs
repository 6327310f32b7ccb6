// crates/granary-store/src/dao/mod.rs
// ============================================================================
// Module: DAO Layer
// Description: One module per logical table plus shared SQL helpers.
// Purpose: Translate driver errors into faults exactly once and keep every
//          statement next to the table it touches.
// Dependencies: granary-core, rusqlite, serde_json
// ============================================================================

//! ## Overview
//! DAO functions are free functions taking a caller-supplied
//! [`rusqlite::Connection`] reference. The facade borrows a pooled
//! connection (or opens a transaction, which derefs to a connection) and
//! threads it through so multi-table operations commit atomically.
//!
//! Fault classification lives here: [`classify`] maps a driver error to a
//! [`StoreFault`] exactly once, at the statement that raised it. Busy and
//! locked errors become retryable transients; constraint violations become
//! conflicts; everything else is unclassified.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod bridge_log;
pub mod broker;
pub mod config_record;
pub mod consumer;
pub mod consumer_state;
pub mod destination;
pub mod message;
pub mod property;
pub mod store_session;
pub mod txn;
pub mod version;

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use granary_core::StoreFault;
use rusqlite::ErrorCode;

// ============================================================================
// SECTION: Table Names
// ============================================================================

/// Message table.
pub const MESSAGE_TABLE: &str = "mqmsg50";
/// Consumer-state table.
pub const CONSUMER_STATE_TABLE: &str = "mqconstate50";
/// Transaction table.
pub const TRANSACTION_TABLE: &str = "mqtxn50";
/// Destination table.
pub const DESTINATION_TABLE: &str = "mqdst50";
/// Durable-consumer table.
pub const CONSUMER_TABLE: &str = "mqconsumer50";
/// Broker membership table.
pub const BROKER_TABLE: &str = "mqbroker50";
/// Store-session ownership table.
pub const SESSION_TABLE: &str = "mqsession50";
/// Property table.
pub const PROPERTY_TABLE: &str = "mqprop50";
/// Configuration change record table.
pub const CONFIG_RECORD_TABLE: &str = "mqccrec50";
/// Bridge transaction-manager log table.
pub const BRIDGE_LOG_TABLE: &str = "mqbridgelog50";
/// Store version table.
pub const VERSION_TABLE: &str = "mqversion50";

/// All logical tables in creation order (referenced before referencing).
pub const ALL_TABLES: [&str; 11] = [
    VERSION_TABLE,
    BROKER_TABLE,
    SESSION_TABLE,
    DESTINATION_TABLE,
    CONSUMER_TABLE,
    MESSAGE_TABLE,
    CONSUMER_STATE_TABLE,
    TRANSACTION_TABLE,
    PROPERTY_TABLE,
    CONFIG_RECORD_TABLE,
    BRIDGE_LOG_TABLE,
];

// ============================================================================
// SECTION: Fault Classification
// ============================================================================

/// Translates a driver error into a [`StoreFault`], once.
///
/// Busy/locked become retryable transients; constraint violations become
/// conflicts; everything else is unclassified.
#[must_use]
pub fn classify(context: &str, err: &rusqlite::Error) -> StoreFault {
    match err {
        rusqlite::Error::SqliteFailure(code, _) => match code.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                StoreFault::transient(format!("{context}: {err}"))
            }
            ErrorCode::ConstraintViolation => StoreFault::conflict(format!("{context}: {err}")),
            _ => StoreFault::other(format!("{context}: {err}")),
        },
        _ => StoreFault::other(format!("{context}: {err}")),
    }
}

// ============================================================================
// SECTION: Value Conversion
// ============================================================================

/// Converts a raw 64-bit identifier to its signed column form.
///
/// # Errors
///
/// Returns [`StoreFault`] when the value exceeds the signed range.
pub fn to_db_id(value: u64) -> Result<i64, StoreFault> {
    i64::try_from(value)
        .map_err(|_| StoreFault::other(format!("identifier {value} exceeds signed 64-bit range")))
}

/// Converts a signed identifier column back to its raw 64-bit form.
///
/// # Errors
///
/// Returns [`StoreFault`] for negative stored values.
pub fn from_db_id(value: i64) -> Result<u64, StoreFault> {
    u64::try_from(value)
        .map_err(|_| StoreFault::other(format!("stored identifier {value} is negative")))
}

/// Converts a row-count or byte-count column to its unsigned form.
///
/// # Errors
///
/// Returns [`StoreFault`] for negative stored values.
pub fn from_db_count(value: i64) -> Result<u64, StoreFault> {
    u64::try_from(value)
        .map_err(|_| StoreFault::other(format!("stored count {value} is negative")))
}

/// Current wall-clock time in unix milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|elapsed| i64::try_from(elapsed.as_millis()).ok())
        .unwrap_or(0)
}

// ============================================================================
// SECTION: Ownership Guard
// ============================================================================

/// WHERE-clause fragment fencing writes to rows whose owning store session
/// belongs to a broker under takeover.
///
/// Applied to HA-mode mutations so a stale writer cannot update rows after
/// a surviving broker has flipped its row into the failover sub-machine.
/// `session_column` names the column holding the owning session identifier
/// in the statement's target table.
#[must_use]
pub fn ownership_guard(session_column: &str) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM {BROKER_TABLE} bkr \
         JOIN {SESSION_TABLE} ses ON ses.broker_id = bkr.id \
         WHERE ses.id = {session_column} \
         AND (bkr.state IN ({pending}, {started}) OR bkr.takeover_broker IS NOT NULL))",
        pending = granary_core::BrokerState::FailoverPending.code(),
        started = granary_core::BrokerState::FailoverStarted.code(),
    )
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use granary_core::FaultKind;
    use proptest::prelude::*;

    use super::*;

    fn sqlite_failure(code: ErrorCode) -> rusqlite::Error {
        rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error {
                code,
                extended_code: 0,
            },
            None,
        )
    }

    #[test]
    fn busy_and_locked_are_transient() {
        for code in [ErrorCode::DatabaseBusy, ErrorCode::DatabaseLocked] {
            let fault = classify("op", &sqlite_failure(code));
            assert_eq!(fault.kind(), FaultKind::Transient);
            assert!(fault.is_retryable());
        }
    }

    #[test]
    fn constraint_violation_is_conflict() {
        let fault = classify("op", &sqlite_failure(ErrorCode::ConstraintViolation));
        assert_eq!(fault.kind(), FaultKind::Conflict);
        assert!(!fault.is_retryable());
    }

    #[test]
    fn id_conversion_rejects_out_of_range() {
        assert!(to_db_id(u64::MAX).is_err());
        assert!(from_db_id(-1).is_err());
        assert_eq!(from_db_id(to_db_id(42).unwrap()).unwrap(), 42);
    }

    proptest! {
        #[test]
        fn classification_never_marks_conflicts_retryable(code in prop_oneof![
            Just(ErrorCode::ConstraintViolation),
            Just(ErrorCode::NotFound),
            Just(ErrorCode::PermissionDenied),
            Just(ErrorCode::ReadOnly),
        ]) {
            let fault = classify("op", &sqlite_failure(code));
            prop_assert!(!fault.is_retryable());
        }

        #[test]
        fn round_trip_ids(value in 0_i64 .. i64::MAX) {
            let raw = from_db_id(value).unwrap();
            prop_assert_eq!(to_db_id(raw).unwrap(), value);
        }
    }
}
