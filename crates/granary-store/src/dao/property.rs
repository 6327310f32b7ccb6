// crates/granary-store/src/dao/property.rs
// ============================================================================
// Module: Property DAO
// Description: Statements against the property table.
// Purpose: Persist broker-scoped name/value pairs as JSON values.
// Dependencies: granary-core, rusqlite, serde_json, crate::dao
// ============================================================================

//! ## Overview
//! Statements against the property table. Persists broker-scoped name/value
//! pairs as JSON values.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::PROPERTY_TABLE;
use crate::dao::classify;

// ============================================================================
// SECTION: Operations
// ============================================================================

/// Stores a property, replacing any existing value.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn put(conn: &Connection, name: &str, value: &serde_json::Value) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {PROPERTY_TABLE} (name, value) VALUES (?1, ?2) \
         ON CONFLICT (name) DO UPDATE SET value = excluded.value"
    );
    let encoded = serde_json::to_vec(value)
        .map_err(|err| StoreFault::other(format!("encode property value: {err}")))?;
    conn.execute(&sql, params![name, encoded])
        .map_err(|err| classify("store property", &err))?;
    Ok(())
}

/// Loads a property value, `None` when absent.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get(conn: &Connection, name: &str) -> Result<Option<serde_json::Value>, StoreFault> {
    let sql = format!("SELECT value FROM {PROPERTY_TABLE} WHERE name = ?1");
    let blob: Option<Vec<u8>> = conn
        .query_row(&sql, params![name], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load property", &err))?;
    blob.map(|bytes| {
        serde_json::from_slice(&bytes)
            .map_err(|err| StoreFault::other(format!("decode property value: {err}")))
    })
    .transpose()
}

/// Deletes a property.
///
/// Deleting an absent property is a no-op, matching the put/overwrite
/// semantics.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete(conn: &Connection, name: &str) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {PROPERTY_TABLE} WHERE name = ?1");
    conn.execute(&sql, params![name]).map_err(|err| classify("delete property", &err))?;
    Ok(())
}

/// Lists every stored property name.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_names(conn: &Connection) -> Result<Vec<String>, StoreFault> {
    let sql = format!("SELECT name FROM {PROPERTY_TABLE} ORDER BY name");
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list property names", &err))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            Ok(name)
        })
        .map_err(|err| classify("list property names", &err))?;
    rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("list property names", &err))
}

/// Loads every property as `(name, value)` pairs.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<(String, serde_json::Value)>, StoreFault> {
    let sql = format!("SELECT name, value FROM {PROPERTY_TABLE} ORDER BY name");
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list properties", &err))?;
    let rows = stmt
        .query_map([], |row| {
            let name: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((name, blob))
        })
        .map_err(|err| classify("list properties", &err))?;
    let mut properties = Vec::new();
    for row in rows {
        let (name, blob) = row.map_err(|err| classify("list properties", &err))?;
        let value = serde_json::from_slice(&blob)
            .map_err(|err| StoreFault::other(format!("decode property value: {err}")))?;
        properties.push((name, value));
    }
    Ok(properties)
}
