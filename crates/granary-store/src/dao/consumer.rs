// crates/granary-store/src/dao/consumer.rs
// ============================================================================
// Module: Consumer DAO
// Description: Statements against the durable-consumer table.
// Purpose: Persist durable subscriptions across broker restarts.
// Dependencies: granary-core, rusqlite, serde_json, crate::dao
// ============================================================================

//! ## Overview
//! Durable consumers survive restarts; their descriptors are opaque JSON
//! blobs. The store indexes only the identifier and the durable name /
//! client-id pair subscriptions are looked up by.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::ConsumerId;
use granary_core::ConsumerRecord;
use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::CONSUMER_TABLE;
use crate::dao::classify;
use crate::dao::from_db_id;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Mutations
// ============================================================================

/// Inserts a durable-consumer row.
///
/// # Errors
///
/// Returns `Conflict` when the identifier already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, record: &ConsumerRecord) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {CONSUMER_TABLE} (id, descriptor, durable_name, client_id, created_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    conn.execute(
        &sql,
        params![
            to_db_id(record.id.get())?,
            serde_json::to_vec(&record.descriptor)
                .map_err(|err| StoreFault::other(format!("encode descriptor: {err}")))?,
            record.durable_name,
            record.client_id,
            record.created_at,
        ],
    )
    .map_err(|err| classify("insert consumer", &err))?;
    Ok(())
}

/// Deletes a durable-consumer row.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn delete(conn: &Connection, id: ConsumerId) -> Result<(), StoreFault> {
    let sql = format!("DELETE FROM {CONSUMER_TABLE} WHERE id = ?1");
    let deleted = conn
        .execute(&sql, params![to_db_id(id.get())?])
        .map_err(|err| classify("delete consumer", &err))?;
    if deleted == 0 {
        return Err(StoreFault::not_found(format!("consumer {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Queries
// ============================================================================

/// Loads one durable-consumer row.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get(conn: &Connection, id: ConsumerId) -> Result<ConsumerRecord, StoreFault> {
    let sql = format!(
        "SELECT id, descriptor, durable_name, client_id, created_ts \
         FROM {CONSUMER_TABLE} WHERE id = ?1"
    );
    let row = conn
        .query_row(&sql, params![to_db_id(id.get())?], map_consumer_row)
        .optional()
        .map_err(|err| classify("load consumer", &err))?;
    match row {
        Some(raw) => raw.into_record(),
        None => Err(StoreFault::not_found(format!("consumer {id} does not exist"))),
    }
}

/// Loads every durable-consumer row.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<ConsumerRecord>, StoreFault> {
    let sql = format!(
        "SELECT id, descriptor, durable_name, client_id, created_ts \
         FROM {CONSUMER_TABLE} ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list consumers", &err))?;
    let rows = stmt
        .query_map([], map_consumer_row)
        .map_err(|err| classify("list consumers", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list consumers", &err))?;
        records.push(raw.into_record()?);
    }
    Ok(records)
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw consumer row prior to identifier conversion.
struct RawConsumerRow {
    /// Consumer identifier column.
    id: i64,
    /// Descriptor column.
    descriptor: Vec<u8>,
    /// Durable name column.
    durable_name: Option<String>,
    /// Client identifier column.
    client_id: Option<String>,
    /// Creation timestamp column.
    created_at: i64,
}

impl RawConsumerRow {
    /// Converts raw columns into a [`ConsumerRecord`].
    fn into_record(self) -> Result<ConsumerRecord, StoreFault> {
        Ok(ConsumerRecord {
            id: ConsumerId::new(from_db_id(self.id)?),
            descriptor: serde_json::from_slice(&self.descriptor)
                .map_err(|err| StoreFault::other(format!("decode descriptor: {err}")))?,
            durable_name: self.durable_name,
            client_id: self.client_id,
            created_at: self.created_at,
        })
    }
}

/// Maps a full consumer row into its raw column form.
fn map_consumer_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawConsumerRow> {
    Ok(RawConsumerRow {
        id: row.get(0)?,
        descriptor: row.get(1)?,
        durable_name: row.get(2)?,
        client_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}
