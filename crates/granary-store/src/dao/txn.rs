// crates/granary-store/src/dao/txn.rs
// ============================================================================
// Module: Transaction DAO
// Description: Statements against the transaction table.
// Purpose: Persist transaction lifecycle state, participant arrays, and
//          the usage counts recovery needs.
// Dependencies: granary-core, rusqlite, serde_json, crate::dao
// ============================================================================

//! ## Overview
//! Participant-broker arrays are stored as a JSON blob; updates to one
//! participant go through a read-verify-mutate-writeback cycle guarded by
//! the transaction's lifecycle state so concurrent completions conflict
//! instead of clobbering each other.
//!
//! In HA mode every mutation carries the ownership guard: the UPDATE's
//! WHERE clause requires that the owning store session's broker is not
//! under takeover, fencing out stale writers.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BrokerId;
use granary_core::BrokerIdentity;
use granary_core::SessionId;
use granary_core::StoreFault;
use granary_core::TransactionBroker;
use granary_core::TransactionId;
use granary_core::TransactionRecord;
use granary_core::TransactionState;
use granary_core::TransactionType;
use granary_core::TransactionUsageInfo;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::CONSUMER_STATE_TABLE;
use crate::dao::MESSAGE_TABLE;
use crate::dao::SESSION_TABLE;
use crate::dao::TRANSACTION_TABLE;
use crate::dao::classify;
use crate::dao::consumer_state;
use crate::dao::from_db_count;
use crate::dao::from_db_id;
use crate::dao::ownership_guard;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Insert
// ============================================================================

/// Inserts a transaction row.
///
/// # Errors
///
/// Returns `Conflict` when the identifier already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, record: &TransactionRecord) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {TRANSACTION_TABLE} \
         (id, type, state, auto_rollback, xid, txn_home_broker, txn_brokers, \
          store_session_id, expired_ts, accessed_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    );
    conn.execute(
        &sql,
        params![
            to_db_id(record.id.get())?,
            record.txn_type.code(),
            record.state.code(),
            i64::from(record.auto_rollback),
            record.xid,
            record.home_broker.as_ref().map(BrokerId::as_str),
            encode_participants(&record.participants)?,
            to_db_id(record.store_session.get())?,
            record.expires_at,
            record.accessed_at,
        ],
    )
    .map_err(|err| classify("insert transaction", &err))?;
    Ok(())
}

// ============================================================================
// SECTION: Updates
// ============================================================================

/// Updates the lifecycle state of a transaction.
///
/// With `replay` set, a zero-row update where the stored state already
/// equals the target is treated as success.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, `OwnershipLost` when the
/// ownership guard fenced the write, or a classified driver fault.
pub fn update_state(
    conn: &Connection,
    identity: &BrokerIdentity,
    id: TransactionId,
    state: TransactionState,
    replay: bool,
) -> Result<(), StoreFault> {
    let sql = if identity.ha_enabled {
        format!(
            "UPDATE {TRANSACTION_TABLE} SET state = ?1, accessed_ts = ?2 WHERE id = ?3 AND {}",
            ownership_guard(&format!("{TRANSACTION_TABLE}.store_session_id"))
        )
    } else {
        format!("UPDATE {TRANSACTION_TABLE} SET state = ?1, accessed_ts = ?2 WHERE id = ?3")
    };
    let updated = conn
        .execute(&sql, params![state.code(), crate::dao::now_millis(), to_db_id(id.get())?])
        .map_err(|err| classify("update transaction state", &err))?;
    if updated == 0 {
        return match get_state_opt(conn, id)? {
            None => Err(StoreFault::not_found(format!("transaction {id} does not exist"))),
            Some(current) if replay && current == state => Ok(()),
            Some(_) => Err(StoreFault::ownership_lost(format!(
                "transaction {id} is owned by a session being taken over"
            ))),
        };
    }
    Ok(())
}

/// Reassigns the home broker of a remote transaction.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_home_broker(
    conn: &Connection,
    id: TransactionId,
    home: &BrokerId,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {TRANSACTION_TABLE} SET txn_home_broker = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![home.as_str(), to_db_id(id.get())?])
        .map_err(|err| classify("update transaction home broker", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("transaction {id} does not exist")));
    }
    Ok(())
}

/// Replaces the participant array of a cluster transaction.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_brokers(
    conn: &Connection,
    id: TransactionId,
    participants: &[TransactionBroker],
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {TRANSACTION_TABLE} SET txn_brokers = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![encode_participants(participants)?, to_db_id(id.get())?])
        .map_err(|err| classify("update transaction brokers", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("transaction {id} does not exist")));
    }
    Ok(())
}

/// Marks one participant complete, compare-and-swap on the lifecycle state.
///
/// Reads the participant array, verifies the transaction is still in
/// `expected` state, mutates the entry, and writes back with the state in
/// the WHERE clause; a concurrent state change surfaces as `Conflict`.
///
/// # Errors
///
/// Returns `NotFound` when the row or participant is absent, `Conflict`
/// on a state mismatch, or a classified driver fault.
pub fn update_broker_state(
    conn: &Connection,
    id: TransactionId,
    expected: TransactionState,
    broker: &BrokerId,
) -> Result<(), StoreFault> {
    let record = get_info(conn, id)?;
    if record.state != expected {
        return Err(StoreFault::conflict(format!(
            "transaction {id} is {:?}, expected {expected:?}",
            record.state
        )));
    }
    let mut participants = record.participants;
    let entry = participants
        .iter_mut()
        .find(|participant| participant.broker == *broker)
        .ok_or_else(|| {
            StoreFault::not_found(format!("broker {broker} is not a participant of {id}"))
        })?;
    entry.completed = true;
    let sql = format!(
        "UPDATE {TRANSACTION_TABLE} SET txn_brokers = ?1 WHERE id = ?2 AND state = ?3"
    );
    let updated = conn
        .execute(
            &sql,
            params![encode_participants(&participants)?, to_db_id(id.get())?, expected.code()],
        )
        .map_err(|err| classify("update participant state", &err))?;
    if updated == 0 {
        return Err(StoreFault::conflict(format!(
            "transaction {id} changed state during participant update"
        )));
    }
    Ok(())
}

/// Refreshes the last-accessed timestamp of a transaction.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_accessed_time(
    conn: &Connection,
    id: TransactionId,
    accessed_at: i64,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {TRANSACTION_TABLE} SET accessed_ts = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![accessed_at, to_db_id(id.get())?])
        .map_err(|err| classify("update transaction accessed time", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("transaction {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Delete
// ============================================================================

/// Deletes a transaction and its tagged consumer-state rows.
///
/// With `replay` set, an already-absent row is treated as success.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent outside replay, or a
/// classified driver fault.
pub fn delete(
    conn: &Connection,
    id: TransactionId,
    replay: bool,
) -> Result<(), StoreFault> {
    consumer_state::delete_by_transaction(conn, id)?;
    let sql = format!("DELETE FROM {TRANSACTION_TABLE} WHERE id = ?1");
    let deleted = conn
        .execute(&sql, params![to_db_id(id.get())?])
        .map_err(|err| classify("delete transaction", &err))?;
    if deleted == 0 && !replay {
        return Err(StoreFault::not_found(format!("transaction {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads the lifecycle state of a transaction.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get_state(conn: &Connection, id: TransactionId) -> Result<TransactionState, StoreFault> {
    get_state_opt(conn, id)?
        .ok_or_else(|| StoreFault::not_found(format!("transaction {id} does not exist")))
}

/// Loads the lifecycle state, `None` when absent.
fn get_state_opt(
    conn: &Connection,
    id: TransactionId,
) -> Result<Option<TransactionState>, StoreFault> {
    let sql = format!("SELECT state FROM {TRANSACTION_TABLE} WHERE id = ?1");
    let code: Option<i64> = conn
        .query_row(&sql, params![to_db_id(id.get())?], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load transaction state", &err))?;
    match code {
        None => Ok(None),
        Some(code) => TransactionState::from_code(code)
            .map(Some)
            .ok_or_else(|| StoreFault::other(format!("unknown transaction state code {code}"))),
    }
}

/// Loads one full transaction record.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get_info(conn: &Connection, id: TransactionId) -> Result<TransactionRecord, StoreFault> {
    let sql = format!(
        "SELECT id, type, state, auto_rollback, xid, txn_home_broker, txn_brokers, \
         store_session_id, expired_ts, accessed_ts \
         FROM {TRANSACTION_TABLE} WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![to_db_id(id.get())?], map_transaction_row)
        .optional()
        .map_err(|err| classify("load transaction", &err))?;
    match row {
        Some(raw) => raw.into_record(),
        None => Err(StoreFault::not_found(format!("transaction {id} does not exist"))),
    }
}

/// Loads every transaction row.
///
/// Backup/dump and recovery path.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<TransactionRecord>, StoreFault> {
    let sql = format!(
        "SELECT id, type, state, auto_rollback, xid, txn_home_broker, txn_brokers, \
         store_session_id, expired_ts, accessed_ts \
         FROM {TRANSACTION_TABLE} ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan transactions", &err))?;
    let rows = stmt
        .query_map([], map_transaction_row)
        .map_err(|err| classify("scan transactions", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("scan transactions", &err))?;
        records.push(raw.into_record()?);
    }
    Ok(records)
}

/// Lists transactions owned by a broker's store sessions.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_by_broker(conn: &Connection, broker: &BrokerId) -> Result<Vec<TransactionId>, StoreFault> {
    let sql = format!(
        "SELECT txn.id FROM {TRANSACTION_TABLE} txn \
         JOIN {SESSION_TABLE} ses ON ses.id = txn.store_session_id \
         WHERE ses.broker_id = ?1"
    );
    collect_ids(conn, &sql, broker)
}

/// Lists remote transactions homed on a broker.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_remote_by_broker(
    conn: &Connection,
    broker: &BrokerId,
) -> Result<Vec<TransactionId>, StoreFault> {
    let sql = format!(
        "SELECT id FROM {TRANSACTION_TABLE} WHERE type = {remote} AND txn_home_broker = ?1",
        remote = TransactionType::Remote.code(),
    );
    collect_ids(conn, &sql, broker)
}

/// Runs an id-returning query keyed by broker.
fn collect_ids(
    conn: &Connection,
    sql: &str,
    broker: &BrokerId,
) -> Result<Vec<TransactionId>, StoreFault> {
    let mut stmt = conn.prepare(sql).map_err(|err| classify("list transactions", &err))?;
    let rows = stmt
        .query_map(params![broker.as_str()], |row| {
            let raw: i64 = row.get(0)?;
            Ok(raw)
        })
        .map_err(|err| classify("list transactions", &err))?;
    let mut ids = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list transactions", &err))?;
        ids.push(TransactionId::new(from_db_id(raw)?));
    }
    Ok(ids)
}

/// Counts messages and acknowledgements tied to one transaction.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_usage_info(
    conn: &Connection,
    id: TransactionId,
) -> Result<TransactionUsageInfo, StoreFault> {
    let sql = format!(
        "SELECT \
         (SELECT COUNT(*) FROM {MESSAGE_TABLE} WHERE txn_id = ?1), \
         (SELECT COUNT(*) FROM {CONSUMER_STATE_TABLE} WHERE txn_id = ?1)"
    );
    let (messages, acks): (i64, i64) = conn
        .query_row(&sql, params![to_db_id(id.get())?], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|err| classify("load transaction usage", &err))?;
    Ok(TransactionUsageInfo {
        message_count: from_db_count(messages)?,
        ack_count: from_db_count(acks)?,
    })
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Encodes a participant array as its JSON column form.
fn encode_participants(participants: &[TransactionBroker]) -> Result<Option<Vec<u8>>, StoreFault> {
    if participants.is_empty() {
        return Ok(None);
    }
    serde_json::to_vec(participants)
        .map(Some)
        .map_err(|err| StoreFault::other(format!("encode participants: {err}")))
}

/// Decodes a participant array from its JSON column form.
fn decode_participants(blob: Option<Vec<u8>>) -> Result<Vec<TransactionBroker>, StoreFault> {
    match blob {
        None => Ok(Vec::new()),
        Some(bytes) => serde_json::from_slice(&bytes)
            .map_err(|err| StoreFault::other(format!("decode participants: {err}"))),
    }
}

/// Raw transaction row prior to identifier conversion.
struct RawTransactionRow {
    /// Transaction identifier column.
    id: i64,
    /// Scope column.
    txn_type: i64,
    /// Lifecycle state column.
    state: i64,
    /// Auto-rollback flag column.
    auto_rollback: i64,
    /// Distributed branch identifier column.
    xid: Option<String>,
    /// Home broker column.
    home_broker: Option<String>,
    /// Participant array column.
    participants: Option<Vec<u8>>,
    /// Owning store session column.
    store_session: i64,
    /// Expiration timestamp column.
    expires_at: i64,
    /// Last-accessed timestamp column.
    accessed_at: i64,
}

impl RawTransactionRow {
    /// Converts raw columns into a [`TransactionRecord`].
    fn into_record(self) -> Result<TransactionRecord, StoreFault> {
        Ok(TransactionRecord {
            id: TransactionId::new(from_db_id(self.id)?),
            txn_type: TransactionType::from_code(self.txn_type).ok_or_else(|| {
                StoreFault::other(format!("unknown transaction type code {}", self.txn_type))
            })?,
            state: TransactionState::from_code(self.state).ok_or_else(|| {
                StoreFault::other(format!("unknown transaction state code {}", self.state))
            })?,
            auto_rollback: self.auto_rollback != 0,
            xid: self.xid,
            home_broker: self.home_broker.map(BrokerId::new),
            participants: decode_participants(self.participants)?,
            store_session: SessionId::new(from_db_id(self.store_session)?),
            expires_at: self.expires_at,
            accessed_at: self.accessed_at,
        })
    }
}

/// Maps a full transaction row into its raw column form.
fn map_transaction_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTransactionRow> {
    Ok(RawTransactionRow {
        id: row.get(0)?,
        txn_type: row.get(1)?,
        state: row.get(2)?,
        auto_rollback: row.get(3)?,
        xid: row.get(4)?,
        home_broker: row.get(5)?,
        participants: row.get(6)?,
        store_session: row.get(7)?,
        expires_at: row.get(8)?,
        accessed_at: row.get(9)?,
    })
}
