// crates/granary-store/src/dao/bridge_log.rs
// ============================================================================
// Module: Bridge Log DAO
// Description: Statements against the bridge transaction-manager log table.
// Purpose: Persist JMS-bridge recovery log records keyed by global
//          transaction branch.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! Statements against the bridge transaction-manager log table. Persists
//! JMS-bridge recovery log records keyed by global transaction branch.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BridgeLogRecord;
use granary_core::BrokerId;
use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::BRIDGE_LOG_TABLE;
use crate::dao::classify;

// ============================================================================
// SECTION: Mutations
// ============================================================================

/// Inserts a bridge log record.
///
/// # Errors
///
/// Returns `Conflict` when the branch key already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, record: &BridgeLogRecord) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {BRIDGE_LOG_TABLE} \
         (xid, log_record, name, broker_id, created_ts, updated_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    );
    conn.execute(
        &sql,
        params![
            record.xid,
            record.log,
            record.name,
            record.broker.as_str(),
            record.created_at,
            record.updated_at,
        ],
    )
    .map_err(|err| classify("insert bridge log", &err))?;
    Ok(())
}

/// Replaces the log payload of an existing record.
///
/// # Errors
///
/// Returns `NotFound` when the record is absent, or a classified driver
/// fault.
pub fn update(
    conn: &Connection,
    xid: &str,
    name: &str,
    log: &[u8],
    updated_at: i64,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {BRIDGE_LOG_TABLE} SET log_record = ?1, updated_ts = ?2 \
         WHERE xid = ?3 AND name = ?4"
    );
    let updated = conn
        .execute(&sql, params![log, updated_at, xid, name])
        .map_err(|err| classify("update bridge log", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("bridge log {xid} for {name} does not exist")));
    }
    Ok(())
}

/// Deletes one bridge log record.
///
/// # Errors
///
/// Returns `NotFound` when the record is absent, or a classified driver
/// fault.
pub fn delete(conn: &Connection, xid: &str, name: &str) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {BRIDGE_LOG_TABLE} WHERE xid = ?1 AND name = ?2");
    let deleted = conn
        .execute(&sql, params![xid, name])
        .map_err(|err| classify("delete bridge log", &err))?;
    if deleted == 0 {
        return Err(StoreFault::not_found(format!("bridge log {xid} for {name} does not exist")));
    }
    Ok(())
}

/// Deletes every record of one bridge service, returning the count.
///
/// Administrative path behind `remove-bridge`.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_name(conn: &Connection, name: &str) -> Result<u64, StoreFault> {
    let sql = format!("DELETE FROM {BRIDGE_LOG_TABLE} WHERE name = ?1");
    let deleted = conn
        .execute(&sql, params![name])
        .map_err(|err| classify("delete bridge logs by name", &err))?;
    Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads one bridge log record, `None` when absent.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get(
    conn: &Connection,
    xid: &str,
    name: &str,
) -> Result<Option<BridgeLogRecord>, StoreFault> {
    let sql = format!(
        "SELECT xid, log_record, name, broker_id, created_ts, updated_ts \
         FROM {BRIDGE_LOG_TABLE} WHERE xid = ?1 AND name = ?2"
    );
    conn.query_row(&sql, params![xid, name], map_bridge_log_row)
        .optional()
        .map_err(|err| classify("load bridge log", &err))
}

/// Lists a bridge service's records written by one broker.
///
/// Recovery path: the bridge replays its log on restart.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_by_name_broker(
    conn: &Connection,
    name: &str,
    broker: &BrokerId,
) -> Result<Vec<BridgeLogRecord>, StoreFault> {
    let sql = format!(
        "SELECT xid, log_record, name, broker_id, created_ts, updated_ts \
         FROM {BRIDGE_LOG_TABLE} WHERE name = ?1 AND broker_id = ?2 ORDER BY created_ts"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list bridge logs", &err))?;
    let rows = stmt
        .query_map(params![name, broker.as_str()], map_bridge_log_row)
        .map_err(|err| classify("list bridge logs", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("list bridge logs", &err))
}

/// Loads every bridge log record.
///
/// Backup/dump path only.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<BridgeLogRecord>, StoreFault> {
    let sql = format!(
        "SELECT xid, log_record, name, broker_id, created_ts, updated_ts \
         FROM {BRIDGE_LOG_TABLE} ORDER BY name, created_ts"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan bridge logs", &err))?;
    let rows = stmt
        .query_map([], map_bridge_log_row)
        .map_err(|err| classify("scan bridge logs", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("scan bridge logs", &err))
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Maps a full bridge log row.
fn map_bridge_log_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<BridgeLogRecord> {
    let broker: String = row.get(3)?;
    Ok(BridgeLogRecord {
        xid: row.get(0)?,
        log: row.get(1)?,
        name: row.get(2)?,
        broker: BrokerId::new(broker),
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}
