// crates/granary-store/src/dao/message.rs
// ============================================================================
// Module: Message DAO
// Description: Statements against the message table.
// Purpose: Insert, delete, move, and query persisted messages, including
//          the single-query pre-insert diagnosis and takeover claim scan.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! The message table is the hot path. Insert failure diagnosis is a single
//! combined query (`can_insert`) so a failed insert costs one round trip
//! to classify: duplicate message, missing destination, or a store session
//! whose owner is being taken over.
//!
//! Replay-ambiguous re-issues are handled by the facade: it calls
//! [`exists`] first and verifies consumer states instead of re-inserting.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BrokerIdentity;
use granary_core::BrokerState;
use granary_core::DestinationId;
use granary_core::MessageId;
use granary_core::MessageRecord;
use granary_core::SessionId;
use granary_core::StorageInfo;
use granary_core::StoreFault;
use granary_core::TransactionId;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::BROKER_TABLE;
use crate::dao::DESTINATION_TABLE;
use crate::dao::MESSAGE_TABLE;
use crate::dao::SESSION_TABLE;
use crate::dao::classify;
use crate::dao::from_db_count;
use crate::dao::from_db_id;
use crate::dao::ownership_guard;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Insert
// ============================================================================

/// Inserts a message row.
///
/// With `check_exists`, runs [`can_insert`] first so the failure is
/// diagnosed before the write; otherwise a duplicate surfaces as a
/// constraint conflict from the insert itself.
///
/// # Errors
///
/// Returns [`StoreFault`] with `Conflict` for duplicates, `NotFound` for
/// a missing destination, `OwnershipLost` when the owning broker is being
/// taken over (HA mode), or a classified driver fault.
pub fn insert(
    conn: &Connection,
    identity: &BrokerIdentity,
    record: &MessageRecord,
    check_exists: bool,
) -> Result<(), StoreFault> {
    if check_exists {
        can_insert(conn, identity, &record.id, &record.destination, record.store_session)?;
    }
    let sql = format!(
        "INSERT INTO {MESSAGE_TABLE} \
         (id, size, store_session_id, dst_id, txn_id, created_ts, payload) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    );
    conn.execute(
        &sql,
        params![
            record.id.as_str(),
            to_db_id(record.size)?,
            to_db_id(record.store_session.get())?,
            record.destination.as_str(),
            record.transaction.map(|txn| to_db_id(txn.get())).transpose()?,
            record.created_at,
            record.payload,
        ],
    )
    .map_err(|err| classify("insert message", &err))?;
    Ok(())
}

/// Diagnoses whether a message can be inserted, in one query.
///
/// # Errors
///
/// `Conflict` when the message already exists, `NotFound` when the
/// destination is missing, `OwnershipLost` when HA is enabled and the
/// owning session's broker is under takeover.
pub fn can_insert(
    conn: &Connection,
    identity: &BrokerIdentity,
    message: &MessageId,
    destination: &DestinationId,
    session: SessionId,
) -> Result<(), StoreFault> {
    let sql = format!(
        "SELECT \
         (SELECT COUNT(*) FROM {MESSAGE_TABLE} WHERE id = ?1), \
         (SELECT COUNT(*) FROM {DESTINATION_TABLE} WHERE id = ?2), \
         (SELECT COUNT(*) FROM {BROKER_TABLE} bkr \
          JOIN {SESSION_TABLE} ses ON ses.broker_id = bkr.id \
          WHERE ses.id = ?3 \
          AND (bkr.state IN ({pending}, {started}) OR bkr.takeover_broker IS NOT NULL))",
        pending = BrokerState::FailoverPending.code(),
        started = BrokerState::FailoverStarted.code(),
    );
    let (msg_count, dst_count, takeover_count): (i64, i64, i64) = conn
        .query_row(
            &sql,
            params![message.as_str(), destination.as_str(), to_db_id(session.get())?],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .map_err(|err| classify("diagnose message insert", &err))?;
    if msg_count > 0 {
        return Err(StoreFault::conflict(format!("message {message} already exists")));
    }
    if dst_count == 0 {
        return Err(StoreFault::not_found(format!("destination {destination} does not exist")));
    }
    if identity.ha_enabled && takeover_count > 0 {
        return Err(StoreFault::ownership_lost(format!(
            "store session {session} is being taken over"
        )));
    }
    Ok(())
}

/// Reports whether a message row exists.
///
/// # Errors
///
/// Returns a classified driver fault on query failure.
pub fn exists(conn: &Connection, id: &MessageId) -> Result<bool, StoreFault> {
    let sql = format!("SELECT 1 FROM {MESSAGE_TABLE} WHERE id = ?1");
    conn.query_row(&sql, params![id.as_str()], |_| Ok(()))
        .optional()
        .map(|found| found.is_some())
        .map_err(|err| classify("check message exists", &err))
}

// ============================================================================
// SECTION: Delete & Move
// ============================================================================

/// Deletes a message row.
///
/// With `replay` set, a missing row is treated as success: the prior
/// ambiguous attempt already applied.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent outside replay, or a
/// classified driver fault.
pub fn delete(
    conn: &Connection,
    identity: &BrokerIdentity,
    id: &MessageId,
    replay: bool,
) -> Result<(), StoreFault> {
    let sql = if identity.ha_enabled {
        format!(
            "DELETE FROM {MESSAGE_TABLE} WHERE id = ?1 AND {}",
            ownership_guard(&format!("{MESSAGE_TABLE}.store_session_id"))
        )
    } else {
        format!("DELETE FROM {MESSAGE_TABLE} WHERE id = ?1")
    };
    let deleted = conn
        .execute(&sql, params![id.as_str()])
        .map_err(|err| classify("delete message", &err))?;
    if deleted == 0 {
        if replay && !exists(conn, id)? {
            return Ok(());
        }
        if identity.ha_enabled && exists(conn, id)? {
            return Err(StoreFault::ownership_lost(format!(
                "message {id} is owned by a session being taken over"
            )));
        }
        return Err(StoreFault::not_found(format!("message {id} does not exist")));
    }
    Ok(())
}

/// Deletes all messages belonging to a destination within a store session.
///
/// Returns the number of rows removed.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_destination(
    conn: &Connection,
    destination: &DestinationId,
    session: Option<SessionId>,
) -> Result<u64, StoreFault> {
    let deleted = match session {
        Some(session) => {
            let sql = format!(
                "DELETE FROM {MESSAGE_TABLE} WHERE dst_id = ?1 AND store_session_id = ?2"
            );
            conn.execute(&sql, params![destination.as_str(), to_db_id(session.get())?])
        }
        None => {
            let sql = format!("DELETE FROM {MESSAGE_TABLE} WHERE dst_id = ?1");
            conn.execute(&sql, params![destination.as_str()])
        }
    }
    .map_err(|err| classify("delete messages by destination", &err))?;
    Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
}

/// Moves a message between destinations.
///
/// The row must currently belong to `from`; a moved-away row surfaces as
/// `NotFound` so the caller re-reads.
///
/// # Errors
///
/// Returns `NotFound` when no row matched, or a classified driver fault.
pub fn move_message(
    conn: &Connection,
    id: &MessageId,
    from: &DestinationId,
    to: &DestinationId,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {MESSAGE_TABLE} SET dst_id = ?1 WHERE id = ?2 AND dst_id = ?3");
    let updated = conn
        .execute(&sql, params![to.as_str(), id.as_str(), from.as_str()])
        .map_err(|err| classify("move message", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("message {id} not found in destination {from}")));
    }
    Ok(())
}

/// Replaces a corrupted message identifier in place.
///
/// Used by recovery when a stored identifier fails to parse; the payload
/// and ownership columns are untouched.
///
/// # Errors
///
/// Returns `NotFound` when the corrupted row is absent, or a classified
/// driver fault.
pub fn repair_corrupted_message_id(
    conn: &Connection,
    corrupted: &MessageId,
    replacement: &MessageId,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {MESSAGE_TABLE} SET id = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![replacement.as_str(), corrupted.as_str()])
        .map_err(|err| classify("repair corrupted message id", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("corrupted message {corrupted} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads one message row.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get_message(conn: &Connection, id: &MessageId) -> Result<MessageRecord, StoreFault> {
    let sql = format!(
        "SELECT id, size, store_session_id, dst_id, txn_id, created_ts, payload \
         FROM {MESSAGE_TABLE} WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id.as_str()], map_message_row)
        .optional()
        .map_err(|err| classify("load message", &err))?;
    match row {
        Some(raw) => raw.into_record(),
        None => Err(StoreFault::not_found(format!("message {id} does not exist"))),
    }
}

/// Lists message identifiers stored for a destination within a session.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_message_ids(
    conn: &Connection,
    destination: &DestinationId,
    session: SessionId,
) -> Result<Vec<MessageId>, StoreFault> {
    let sql = format!(
        "SELECT id FROM {MESSAGE_TABLE} WHERE dst_id = ?1 AND store_session_id = ?2 \
         ORDER BY created_ts"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list message ids", &err))?;
    let rows = stmt
        .query_map(params![destination.as_str(), to_db_id(session.get())?], |row| {
            let id: String = row.get(0)?;
            Ok(MessageId::new(id))
        })
        .map_err(|err| classify("list message ids", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("list message ids", &err))
}

/// Lists `(message, destination)` pairs owned by a broker's sessions.
///
/// This is the takeover claim scan: the new owner records exactly which
/// messages it inherits.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_message_ids_by_broker(
    conn: &Connection,
    broker: &granary_core::BrokerId,
) -> Result<Vec<(MessageId, DestinationId)>, StoreFault> {
    let sql = format!(
        "SELECT msg.id, msg.dst_id FROM {MESSAGE_TABLE} msg \
         JOIN {SESSION_TABLE} ses ON ses.id = msg.store_session_id \
         WHERE ses.broker_id = ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan broker messages", &err))?;
    let rows = stmt
        .query_map(params![broker.as_str()], |row| {
            let id: String = row.get(0)?;
            let dst: String = row.get(1)?;
            Ok((MessageId::new(id), DestinationId::new(dst)))
        })
        .map_err(|err| classify("scan broker messages", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("scan broker messages", &err))
}

/// Counts messages stored for a destination.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_message_count(conn: &Connection, destination: &DestinationId) -> Result<u64, StoreFault> {
    let sql = format!("SELECT COUNT(*) FROM {MESSAGE_TABLE} WHERE dst_id = ?1");
    let count: i64 = conn
        .query_row(&sql, params![destination.as_str()], |row| row.get(0))
        .map_err(|err| classify("count messages", &err))?;
    from_db_count(count)
}

/// Returns message count and aggregate payload bytes for a destination.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_storage_info(
    conn: &Connection,
    destination: &DestinationId,
) -> Result<StorageInfo, StoreFault> {
    let sql = format!(
        "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM {MESSAGE_TABLE} WHERE dst_id = ?1"
    );
    let (count, bytes): (i64, i64) = conn
        .query_row(&sql, params![destination.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|err| classify("load storage info", &err))?;
    Ok(StorageInfo {
        count: from_db_count(count)?,
        bytes: from_db_count(bytes)?,
    })
}

/// Loads every message row, oldest first.
///
/// Backup/dump path only; regular delivery reads by destination.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<MessageRecord>, StoreFault> {
    let sql = format!(
        "SELECT id, size, store_session_id, dst_id, txn_id, created_ts, payload \
         FROM {MESSAGE_TABLE} ORDER BY created_ts"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan messages", &err))?;
    let rows = stmt
        .query_map([], map_message_row)
        .map_err(|err| classify("scan messages", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("scan messages", &err))?;
        records.push(raw.into_record()?);
    }
    Ok(records)
}

/// Reports whether every consumer has acknowledged the message.
///
/// Returns `false` when the message has no consumer states at all.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn has_been_acked(conn: &Connection, id: &MessageId) -> Result<bool, StoreFault> {
    let sql = format!(
        "SELECT COUNT(*), SUM(CASE WHEN state = {acked} THEN 1 ELSE 0 END) \
         FROM {table} WHERE msg_id = ?1",
        acked = granary_core::DeliveryState::Acknowledged.code(),
        table = crate::dao::CONSUMER_STATE_TABLE,
    );
    let (total, acked): (i64, Option<i64>) = conn
        .query_row(&sql, params![id.as_str()], |row| Ok((row.get(0)?, row.get(1)?)))
        .map_err(|err| classify("check message acknowledged", &err))?;
    Ok(total > 0 && acked == Some(total))
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw message row prior to identifier conversion.
struct RawMessageRow {
    /// Message identifier column.
    id: String,
    /// Size column.
    size: i64,
    /// Owning store session column.
    store_session: i64,
    /// Destination column.
    destination: String,
    /// Transaction tag column.
    transaction: Option<i64>,
    /// Creation timestamp column.
    created_at: i64,
    /// Payload column.
    payload: Vec<u8>,
}

impl RawMessageRow {
    /// Converts raw columns into a [`MessageRecord`].
    fn into_record(self) -> Result<MessageRecord, StoreFault> {
        Ok(MessageRecord {
            id: MessageId::new(self.id),
            destination: DestinationId::new(self.destination),
            payload: self.payload,
            size: from_db_count(self.size)?,
            store_session: SessionId::new(from_db_id(self.store_session)?),
            transaction: self
                .transaction
                .map(|raw| Ok::<_, StoreFault>(TransactionId::new(from_db_id(raw)?)))
                .transpose()?,
            created_at: self.created_at,
        })
    }
}

/// Maps a full message row into its raw column form.
fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMessageRow> {
    Ok(RawMessageRow {
        id: row.get(0)?,
        size: row.get(1)?,
        store_session: row.get(2)?,
        destination: row.get(3)?,
        transaction: row.get(4)?,
        created_at: row.get(5)?,
        payload: row.get(6)?,
    })
}
