// crates/granary-store/src/dao/consumer_state.rs
// ============================================================================
// Module: Consumer State DAO
// Description: Statements against the per-consumer delivery state table.
// Purpose: Track delivery progress and transaction-tagged acknowledgements
//          for each (message, consumer) pair.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! One row per `(message, consumer)` pair. Rows always reference an
//! existing message; bulk insert diagnoses a missing message explicitly so
//! the session layer sees `NotFound` rather than a bare constraint error.
//!
//! `update_state_expected` is the compare-and-swap used by the
//! acknowledgement path: a zero-row update is re-diagnosed into `NotFound`
//! (row gone) or `PreconditionFailed` (state moved underneath the caller).

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::ConsumerId;
use granary_core::ConsumerStateRecord;
use granary_core::DeliveryState;
use granary_core::DestinationId;
use granary_core::MessageId;
use granary_core::SessionId;
use granary_core::StoreFault;
use granary_core::TransactionAck;
use granary_core::TransactionId;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::CONSUMER_STATE_TABLE;
use crate::dao::MESSAGE_TABLE;
use crate::dao::classify;
use crate::dao::from_db_id;
use crate::dao::message;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Insert
// ============================================================================

/// Inserts the initial delivery states for a message, one row per consumer.
///
/// # Errors
///
/// Returns `NotFound` when the message row is absent, `Conflict` when a
/// state row already exists, or a classified driver fault.
pub fn insert(
    conn: &Connection,
    message_id: &MessageId,
    states: &[(ConsumerId, DeliveryState)],
    transaction: Option<TransactionId>,
    created_at: i64,
) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {CONSUMER_STATE_TABLE} (msg_id, consumer_id, state, txn_id, created_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    let txn_column = transaction.map(|txn| to_db_id(txn.get())).transpose()?;
    for (consumer, state) in states {
        let inserted = conn.execute(
            &sql,
            params![
                message_id.as_str(),
                to_db_id(consumer.get())?,
                state.code(),
                txn_column,
                created_at,
            ],
        );
        if let Err(err) = inserted {
            let fault = classify("insert consumer state", &err);
            if !message::exists(conn, message_id)? {
                return Err(StoreFault::not_found(format!(
                    "message {message_id} does not exist"
                )));
            }
            return Err(fault);
        }
    }
    Ok(())
}

/// Reports whether the stored states exactly match the given set.
///
/// This is the replay check for state insertion: a prior ambiguous attempt
/// fully applied iff every pair is present with the same state and no
/// extra rows exist.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn states_match(
    conn: &Connection,
    message_id: &MessageId,
    states: &[(ConsumerId, DeliveryState)],
) -> Result<bool, StoreFault> {
    let stored = get_states(conn, message_id)?;
    if stored.len() != states.len() {
        return Ok(false);
    }
    for (consumer, state) in states {
        let found = stored
            .iter()
            .any(|record| record.consumer == *consumer && record.state == *state);
        if !found {
            return Ok(false);
        }
    }
    Ok(true)
}

// ============================================================================
// SECTION: State Updates
// ============================================================================

/// Updates one delivery state unconditionally.
///
/// With `replay` set, a zero-row update where the stored state already
/// equals the target is treated as success.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_state(
    conn: &Connection,
    message_id: &MessageId,
    consumer: ConsumerId,
    state: DeliveryState,
    replay: bool,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {CONSUMER_STATE_TABLE} SET state = ?1 WHERE msg_id = ?2 AND consumer_id = ?3"
    );
    let updated = conn
        .execute(&sql, params![state.code(), message_id.as_str(), to_db_id(consumer.get())?])
        .map_err(|err| classify("update consumer state", &err))?;
    if updated == 0 {
        if replay && get_state_opt(conn, message_id, consumer)? == Some(state) {
            return Ok(());
        }
        return Err(StoreFault::not_found(format!(
            "no state for message {message_id} consumer {consumer}"
        )));
    }
    Ok(())
}

/// Updates one delivery state only when the stored state matches.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, `PreconditionFailed` when
/// the stored state differs from `expected`, or a classified driver
/// fault.
pub fn update_state_expected(
    conn: &Connection,
    message_id: &MessageId,
    consumer: ConsumerId,
    expected: DeliveryState,
    state: DeliveryState,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {CONSUMER_STATE_TABLE} SET state = ?1 \
         WHERE msg_id = ?2 AND consumer_id = ?3 AND state = ?4"
    );
    let updated = conn
        .execute(
            &sql,
            params![state.code(), message_id.as_str(), to_db_id(consumer.get())?, expected.code()],
        )
        .map_err(|err| classify("update consumer state (expected)", &err))?;
    if updated == 0 {
        return match get_state_opt(conn, message_id, consumer)? {
            None => Err(StoreFault::not_found(format!(
                "no state for message {message_id} consumer {consumer}"
            ))),
            Some(current) if current == state => Ok(()),
            Some(current) => Err(StoreFault::precondition(format!(
                "state for message {message_id} consumer {consumer} is {current:?}, \
                 expected {expected:?}"
            ))),
        };
    }
    Ok(())
}

/// Tags an acknowledgement row with a transaction.
///
/// # Errors
///
/// Returns `Conflict` when the row is already tagged with a different
/// transaction, `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_transaction(
    conn: &Connection,
    message_id: &MessageId,
    consumer: ConsumerId,
    transaction: TransactionId,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {CONSUMER_STATE_TABLE} SET txn_id = ?1 \
         WHERE msg_id = ?2 AND consumer_id = ?3 AND txn_id IS NULL"
    );
    let updated = conn
        .execute(
            &sql,
            params![to_db_id(transaction.get())?, message_id.as_str(), to_db_id(consumer.get())?],
        )
        .map_err(|err| classify("tag acknowledgement", &err))?;
    if updated == 0 {
        return match get_state_opt(conn, message_id, consumer)? {
            None => Err(StoreFault::not_found(format!(
                "no state for message {message_id} consumer {consumer}"
            ))),
            Some(_) => Err(StoreFault::conflict(format!(
                "acknowledgement for message {message_id} consumer {consumer} \
                 is already tagged with a transaction"
            ))),
        };
    }
    Ok(())
}

/// Clears the transaction tag from every row tagged with `transaction`.
///
/// Used on rollback so the acknowledgements return to the untagged pool.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn clear_transaction(conn: &Connection, transaction: TransactionId) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {CONSUMER_STATE_TABLE} SET txn_id = NULL WHERE txn_id = ?1");
    conn.execute(&sql, params![to_db_id(transaction.get())?])
        .map_err(|err| classify("clear acknowledgement tags", &err))?;
    Ok(())
}

// ============================================================================
// SECTION: Deletes
// ============================================================================

/// Deletes every state row for a message.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_message(conn: &Connection, message_id: &MessageId) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {CONSUMER_STATE_TABLE} WHERE msg_id = ?1");
    conn.execute(&sql, params![message_id.as_str()])
        .map_err(|err| classify("delete states by message", &err))?;
    Ok(())
}

/// Deletes every state row tagged with a transaction.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_transaction(conn: &Connection, transaction: TransactionId) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {CONSUMER_STATE_TABLE} WHERE txn_id = ?1");
    conn.execute(&sql, params![to_db_id(transaction.get())?])
        .map_err(|err| classify("delete states by transaction", &err))?;
    Ok(())
}

/// Deletes every state row whose message belongs to a destination within
/// a store session.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_destination_session(
    conn: &Connection,
    destination: &DestinationId,
    session: Option<SessionId>,
) -> Result<(), StoreFault> {
    match session {
        Some(session) => {
            let sql = format!(
                "DELETE FROM {CONSUMER_STATE_TABLE} WHERE msg_id IN \
                 (SELECT id FROM {MESSAGE_TABLE} WHERE dst_id = ?1 AND store_session_id = ?2)"
            );
            conn.execute(&sql, params![destination.as_str(), to_db_id(session.get())?])
        }
        None => {
            let sql = format!(
                "DELETE FROM {CONSUMER_STATE_TABLE} WHERE msg_id IN \
                 (SELECT id FROM {MESSAGE_TABLE} WHERE dst_id = ?1)"
            );
            conn.execute(&sql, params![destination.as_str()])
        }
    }
    .map_err(|err| classify("delete states by destination", &err))?;
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads one delivery state.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn get_state(
    conn: &Connection,
    message_id: &MessageId,
    consumer: ConsumerId,
) -> Result<DeliveryState, StoreFault> {
    get_state_opt(conn, message_id, consumer)?.ok_or_else(|| {
        StoreFault::not_found(format!("no state for message {message_id} consumer {consumer}"))
    })
}

/// Loads one delivery state, `None` when absent.
fn get_state_opt(
    conn: &Connection,
    message_id: &MessageId,
    consumer: ConsumerId,
) -> Result<Option<DeliveryState>, StoreFault> {
    let sql = format!(
        "SELECT state FROM {CONSUMER_STATE_TABLE} WHERE msg_id = ?1 AND consumer_id = ?2"
    );
    let code: Option<i64> = conn
        .query_row(&sql, params![message_id.as_str(), to_db_id(consumer.get())?], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load consumer state", &err))?;
    match code {
        None => Ok(None),
        Some(code) => DeliveryState::from_code(code)
            .map(Some)
            .ok_or_else(|| StoreFault::other(format!("unknown delivery state code {code}"))),
    }
}

/// Loads every state row for a message.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_states(
    conn: &Connection,
    message_id: &MessageId,
) -> Result<Vec<ConsumerStateRecord>, StoreFault> {
    let sql = format!(
        "SELECT msg_id, consumer_id, state, txn_id, created_ts \
         FROM {CONSUMER_STATE_TABLE} WHERE msg_id = ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("load consumer states", &err))?;
    let rows = stmt
        .query_map(params![message_id.as_str()], |row| {
            let msg: String = row.get(0)?;
            let consumer: i64 = row.get(1)?;
            let state: i64 = row.get(2)?;
            let transaction: Option<i64> = row.get(3)?;
            let created_at: i64 = row.get(4)?;
            Ok((msg, consumer, state, transaction, created_at))
        })
        .map_err(|err| classify("load consumer states", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let (msg, consumer, state, transaction, created_at) =
            row.map_err(|err| classify("load consumer states", &err))?;
        records.push(ConsumerStateRecord {
            message: MessageId::new(msg),
            consumer: ConsumerId::new(from_db_id(consumer)?),
            state: DeliveryState::from_code(state)
                .ok_or_else(|| StoreFault::other(format!("unknown delivery state code {state}")))?,
            transaction: transaction
                .map(|raw| Ok::<_, StoreFault>(TransactionId::new(from_db_id(raw)?)))
                .transpose()?,
            created_at,
        });
    }
    Ok(records)
}

/// Loads every state row.
///
/// Backup/dump path only.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<ConsumerStateRecord>, StoreFault> {
    let sql = format!(
        "SELECT msg_id, consumer_id, state, txn_id, created_ts \
         FROM {CONSUMER_STATE_TABLE} ORDER BY msg_id, consumer_id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan consumer states", &err))?;
    let rows = stmt
        .query_map([], |row| {
            let msg: String = row.get(0)?;
            let consumer: i64 = row.get(1)?;
            let state: i64 = row.get(2)?;
            let transaction: Option<i64> = row.get(3)?;
            let created_at: i64 = row.get(4)?;
            Ok((msg, consumer, state, transaction, created_at))
        })
        .map_err(|err| classify("scan consumer states", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let (msg, consumer, state, transaction, created_at) =
            row.map_err(|err| classify("scan consumer states", &err))?;
        records.push(ConsumerStateRecord {
            message: MessageId::new(msg),
            consumer: ConsumerId::new(from_db_id(consumer)?),
            state: DeliveryState::from_code(state)
                .ok_or_else(|| StoreFault::other(format!("unknown delivery state code {state}")))?,
            transaction: transaction
                .map(|raw| Ok::<_, StoreFault>(TransactionId::new(from_db_id(raw)?)))
                .transpose()?,
            created_at,
        });
    }
    Ok(records)
}

/// Lists consumer identifiers holding state for a message.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_consumer_ids(
    conn: &Connection,
    message_id: &MessageId,
) -> Result<Vec<ConsumerId>, StoreFault> {
    let sql = format!("SELECT consumer_id FROM {CONSUMER_STATE_TABLE} WHERE msg_id = ?1");
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list consumer ids", &err))?;
    let rows = stmt
        .query_map(params![message_id.as_str()], |row| {
            let raw: i64 = row.get(0)?;
            Ok(raw)
        })
        .map_err(|err| classify("list consumer ids", &err))?;
    let mut ids = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list consumer ids", &err))?;
        ids.push(ConsumerId::new(from_db_id(raw)?));
    }
    Ok(ids)
}

/// Lists acknowledgements tagged with one transaction.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_transaction_acks(
    conn: &Connection,
    transaction: TransactionId,
) -> Result<Vec<TransactionAck>, StoreFault> {
    let sql = format!(
        "SELECT msg_id, consumer_id FROM {CONSUMER_STATE_TABLE} WHERE txn_id = ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list transaction acks", &err))?;
    let rows = stmt
        .query_map(params![to_db_id(transaction.get())?], |row| {
            let msg: String = row.get(0)?;
            let consumer: i64 = row.get(1)?;
            Ok((msg, consumer))
        })
        .map_err(|err| classify("list transaction acks", &err))?;
    let mut acks = Vec::new();
    for row in rows {
        let (msg, consumer) = row.map_err(|err| classify("list transaction acks", &err))?;
        acks.push(TransactionAck {
            message: MessageId::new(msg),
            consumer: ConsumerId::new(from_db_id(consumer)?),
        });
    }
    Ok(acks)
}

/// Lists every transaction-tagged acknowledgement, grouped by transaction.
///
/// Used during recovery to rebuild the in-memory transaction ledger.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all_transaction_acks(
    conn: &Connection,
) -> Result<Vec<(TransactionId, TransactionAck)>, StoreFault> {
    let sql = format!(
        "SELECT txn_id, msg_id, consumer_id FROM {CONSUMER_STATE_TABLE} \
         WHERE txn_id IS NOT NULL ORDER BY txn_id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list all transaction acks", &err))?;
    let rows = stmt
        .query_map([], |row| {
            let txn: i64 = row.get(0)?;
            let msg: String = row.get(1)?;
            let consumer: i64 = row.get(2)?;
            Ok((txn, msg, consumer))
        })
        .map_err(|err| classify("list all transaction acks", &err))?;
    let mut acks = Vec::new();
    for row in rows {
        let (txn, msg, consumer) = row.map_err(|err| classify("list all transaction acks", &err))?;
        acks.push((
            TransactionId::new(from_db_id(txn)?),
            TransactionAck {
                message: MessageId::new(msg),
                consumer: ConsumerId::new(from_db_id(consumer)?),
            },
        ));
    }
    Ok(acks)
}
