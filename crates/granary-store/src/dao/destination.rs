// crates/granary-store/src/dao/destination.rs
// ============================================================================
// Module: Destination DAO
// Description: Statements against the destination table.
// Purpose: Persist queue/topic descriptors and enumerate the local
//          destinations a takeover claims.
// Dependencies: granary-core, rusqlite, serde_json, crate::dao
// ============================================================================

//! ## Overview
//! Destination descriptors are opaque JSON blobs owned by the session
//! layer; the store only indexes identity, locality, the owning
//! connection for temporaries, and the owning store session for local
//! destinations.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BrokerId;
use granary_core::DestinationId;
use granary_core::DestinationRecord;
use granary_core::SessionId;
use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::DESTINATION_TABLE;
use crate::dao::SESSION_TABLE;
use crate::dao::classify;
use crate::dao::from_db_id;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Mutations
// ============================================================================

/// Inserts a destination row.
///
/// # Errors
///
/// Returns `Conflict` when the identifier already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, record: &DestinationRecord) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {DESTINATION_TABLE} \
         (id, descriptor, is_local, connection_id, store_session_id, created_ts, connected_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
    );
    conn.execute(
        &sql,
        params![
            record.id.as_str(),
            encode_descriptor(&record.descriptor)?,
            i64::from(record.is_local),
            record.connection_id.map(to_db_id).transpose()?,
            record.store_session.map(|session| to_db_id(session.get())).transpose()?,
            record.created_at,
            record.connected_at,
        ],
    )
    .map_err(|err| classify("insert destination", &err))?;
    Ok(())
}

/// Replaces the descriptor of an existing destination.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_descriptor(
    conn: &Connection,
    id: &DestinationId,
    descriptor: &serde_json::Value,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {DESTINATION_TABLE} SET descriptor = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![encode_descriptor(descriptor)?, id.as_str()])
        .map_err(|err| classify("update destination", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("destination {id} does not exist")));
    }
    Ok(())
}

/// Refreshes the client-attach timestamp of a temporary destination.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_connected_time(
    conn: &Connection,
    id: &DestinationId,
    connected_at: i64,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {DESTINATION_TABLE} SET connected_ts = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![connected_at, id.as_str()])
        .map_err(|err| classify("update destination connected time", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("destination {id} does not exist")));
    }
    Ok(())
}

/// Deletes a destination row.
///
/// Message and consumer-state cleanup is the caller's responsibility and
/// runs in the same transaction.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn delete(conn: &Connection, id: &DestinationId) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {DESTINATION_TABLE} WHERE id = ?1");
    let deleted = conn
        .execute(&sql, params![id.as_str()])
        .map_err(|err| classify("delete destination", &err))?;
    if deleted == 0 {
        return Err(StoreFault::not_found(format!("destination {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads one destination row.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get(conn: &Connection, id: &DestinationId) -> Result<DestinationRecord, StoreFault> {
    let sql = format!(
        "SELECT id, descriptor, is_local, connection_id, store_session_id, created_ts, \
         connected_ts \
         FROM {DESTINATION_TABLE} WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id.as_str()], map_destination_row)
        .optional()
        .map_err(|err| classify("load destination", &err))?;
    match row {
        Some(raw) => raw.into_record(),
        None => Err(StoreFault::not_found(format!("destination {id} does not exist"))),
    }
}

/// Lists every destination visible to a store session.
///
/// Global (non-local) destinations are always included; local ones only
/// for the given session. With `None`, every row is returned.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(
    conn: &Connection,
    session: Option<SessionId>,
) -> Result<Vec<DestinationRecord>, StoreFault> {
    let mut stmt;
    let rows = match session {
        Some(session) => {
            let sql = format!(
                "SELECT id, descriptor, is_local, connection_id, store_session_id, created_ts, \
                 connected_ts \
                 FROM {DESTINATION_TABLE} \
                 WHERE is_local = 0 OR store_session_id = ?1 ORDER BY id"
            );
            stmt = conn.prepare(&sql).map_err(|err| classify("list destinations", &err))?;
            stmt.query_map(params![to_db_id(session.get())?], map_destination_row)
        }
        None => {
            let sql = format!(
                "SELECT id, descriptor, is_local, connection_id, store_session_id, created_ts, \
                 connected_ts \
                 FROM {DESTINATION_TABLE} ORDER BY id"
            );
            stmt = conn.prepare(&sql).map_err(|err| classify("list destinations", &err))?;
            stmt.query_map([], map_destination_row)
        }
    }
    .map_err(|err| classify("list destinations", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list destinations", &err))?;
        records.push(raw.into_record()?);
    }
    Ok(records)
}

/// Lists local destinations owned by a broker's sessions.
///
/// Takeover enumeration: these are the destinations the new owner claims.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_local_by_broker(
    conn: &Connection,
    broker: &BrokerId,
) -> Result<Vec<DestinationRecord>, StoreFault> {
    let sql = format!(
        "SELECT dst.id, dst.descriptor, dst.is_local, dst.connection_id, \
         dst.store_session_id, dst.created_ts, dst.connected_ts \
         FROM {DESTINATION_TABLE} dst \
         JOIN {SESSION_TABLE} ses ON ses.id = dst.store_session_id \
         WHERE dst.is_local = 1 AND ses.broker_id = ?1"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list local destinations", &err))?;
    let rows = stmt
        .query_map(params![broker.as_str()], map_destination_row)
        .map_err(|err| classify("list local destinations", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list local destinations", &err))?;
        records.push(raw.into_record()?);
    }
    Ok(records)
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Encodes a descriptor as its JSON column form.
fn encode_descriptor(descriptor: &serde_json::Value) -> Result<Vec<u8>, StoreFault> {
    serde_json::to_vec(descriptor)
        .map_err(|err| StoreFault::other(format!("encode descriptor: {err}")))
}

/// Raw destination row prior to identifier conversion.
struct RawDestinationRow {
    /// Destination identifier column.
    id: String,
    /// Descriptor column.
    descriptor: Vec<u8>,
    /// Locality flag column.
    is_local: i64,
    /// Owning connection column.
    connection_id: Option<i64>,
    /// Owning store session column.
    store_session: Option<i64>,
    /// Creation timestamp column.
    created_at: i64,
    /// Client-attach timestamp column.
    connected_at: Option<i64>,
}

impl RawDestinationRow {
    /// Converts raw columns into a [`DestinationRecord`].
    fn into_record(self) -> Result<DestinationRecord, StoreFault> {
        Ok(DestinationRecord {
            id: DestinationId::new(self.id),
            descriptor: serde_json::from_slice(&self.descriptor)
                .map_err(|err| StoreFault::other(format!("decode descriptor: {err}")))?,
            is_local: self.is_local != 0,
            connection_id: self.connection_id.map(from_db_id).transpose()?,
            store_session: self
                .store_session
                .map(|raw| Ok::<_, StoreFault>(SessionId::new(from_db_id(raw)?)))
                .transpose()?,
            created_at: self.created_at,
            connected_at: self.connected_at,
        })
    }
}

/// Maps a full destination row into its raw column form.
fn map_destination_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDestinationRow> {
    Ok(RawDestinationRow {
        id: row.get(0)?,
        descriptor: row.get(1)?,
        is_local: row.get(2)?,
        connection_id: row.get(3)?,
        store_session: row.get(4)?,
        created_at: row.get(5)?,
        connected_at: row.get(6)?,
    })
}
