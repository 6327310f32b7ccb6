// crates/granary-store/src/dao/config_record.rs
// ============================================================================
// Module: Config Record DAO
// Description: Statements against the configuration change record table.
// Purpose: Append-only journal of cluster configuration changes ordered
//          by record timestamp.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! Statements against the configuration change record table. An append-only
//! journal of cluster configuration changes ordered by record timestamp.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::ConfigChangeRecord;
use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::params;

use crate::dao::CONFIG_RECORD_TABLE;
use crate::dao::classify;

// ============================================================================
// SECTION: Operations
// ============================================================================

/// Appends a configuration change record.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn insert(conn: &Connection, record: &ConfigChangeRecord) -> Result<(), StoreFault> {
    let sql = format!("INSERT INTO {CONFIG_RECORD_TABLE} (record_ts, record) VALUES (?1, ?2)");
    conn.execute(&sql, params![record.created_at, record.record])
        .map_err(|err| classify("append config record", &err))?;
    Ok(())
}

/// Loads records created strictly after `since` in journal order.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_since(conn: &Connection, since: i64) -> Result<Vec<ConfigChangeRecord>, StoreFault> {
    let sql = format!(
        "SELECT record_ts, record FROM {CONFIG_RECORD_TABLE} \
         WHERE record_ts > ?1 ORDER BY record_ts"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan config records", &err))?;
    let rows = stmt
        .query_map(params![since], |row| {
            let created_at: i64 = row.get(0)?;
            let record: Vec<u8> = row.get(1)?;
            Ok(ConfigChangeRecord {
                created_at,
                record,
            })
        })
        .map_err(|err| classify("scan config records", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("scan config records", &err))
}

/// Loads the whole journal in order.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<ConfigChangeRecord>, StoreFault> {
    get_since(conn, i64::MIN)
}
