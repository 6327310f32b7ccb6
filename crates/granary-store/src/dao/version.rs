// crates/granary-store/src/dao/version.rs
// ============================================================================
// Module: Version DAO
// Description: Statements against the store version table.
// Purpose: Record the schema version and hold the administrative table
//          lock that serializes destructive admin commands.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! The version table holds exactly one row: the store's schema version and
//! an optional lock holder. Administrative commands that rewrite tables
//! take the lock first (CAS on `lock_id IS NULL`); a lock held by a
//! crashed process is cleared with `reset_lock`.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::VERSION_TABLE;
use crate::dao::classify;

// ============================================================================
// SECTION: Version
// ============================================================================

/// Inserts the single version row.
///
/// # Errors
///
/// Returns `Conflict` when a row already exists, or a classified driver
/// fault.
pub fn insert(conn: &Connection, version: i64) -> Result<(), StoreFault> {
    let sql = format!("INSERT INTO {VERSION_TABLE} (store_version, lock_id) VALUES (?1, NULL)");
    conn.execute(&sql, params![version]).map_err(|err| classify("insert version", &err))?;
    Ok(())
}

/// Loads the stored schema version, `None` when the row is absent.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_version(conn: &Connection) -> Result<Option<i64>, StoreFault> {
    let sql = format!("SELECT store_version FROM {VERSION_TABLE} LIMIT 1");
    conn.query_row(&sql, [], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load version", &err))
}

/// Updates the stored schema version.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn set_version(conn: &Connection, version: i64) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {VERSION_TABLE} SET store_version = ?1");
    let updated = conn
        .execute(&sql, params![version])
        .map_err(|err| classify("update version", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found("version row does not exist"));
    }
    Ok(())
}

// ============================================================================
// SECTION: Table Lock
// ============================================================================

/// Acquires the administrative table lock for `holder`.
///
/// Re-acquiring a lock already held by the same holder succeeds.
///
/// # Errors
///
/// Returns `Conflict` naming the current holder when the lock is taken,
/// `NotFound` when the version row is absent, or a classified driver
/// fault.
pub fn acquire_lock(conn: &Connection, holder: &str) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {VERSION_TABLE} SET lock_id = ?1 WHERE lock_id IS NULL OR lock_id = ?1"
    );
    let updated = conn
        .execute(&sql, params![holder])
        .map_err(|err| classify("acquire table lock", &err))?;
    if updated == 0 {
        return match get_lock(conn)? {
            Some(current) => Err(StoreFault::conflict(format!(
                "store tables are locked by {current}; use reset-lock if that process is gone"
            ))),
            None => Err(StoreFault::not_found("version row does not exist")),
        };
    }
    Ok(())
}

/// Releases the table lock if held by `holder`.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn release_lock(conn: &Connection, holder: &str) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {VERSION_TABLE} SET lock_id = NULL WHERE lock_id = ?1");
    conn.execute(&sql, params![holder])
        .map_err(|err| classify("release table lock", &err))?;
    Ok(())
}

/// Clears the table lock unconditionally.
///
/// Administrative recovery for a lock left behind by a crashed process.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn reset_lock(conn: &Connection) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {VERSION_TABLE} SET lock_id = NULL");
    conn.execute(&sql, []).map_err(|err| classify("reset table lock", &err))?;
    Ok(())
}

/// Loads the current lock holder, `None` when unlocked.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_lock(conn: &Connection) -> Result<Option<String>, StoreFault> {
    let sql = format!("SELECT lock_id FROM {VERSION_TABLE} LIMIT 1");
    conn.query_row(&sql, [], |row| row.get(0))
        .optional()
        .map(Option::flatten)
        .map_err(|err| classify("load table lock", &err))
}
