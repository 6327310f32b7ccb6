// crates/granary-store/src/dao/store_session.rs
// ============================================================================
// Module: Store Session DAO
// Description: Statements against the store-session ownership table.
// Purpose: Track which broker owns each store session and reassign
//          ownership during takeover and partition migration.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! The store session is the unit of HA takeover and of partitioning.
//! Ownership moves in two ways: wholesale (takeover reassigns every
//! session of a failed broker) or one at a time (`move_session`, partition
//! migration). Both are CAS updates keyed on the current owner so a racing
//! reassignment conflicts instead of silently double-assigning.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BrokerId;
use granary_core::SessionId;
use granary_core::StoreFault;
use granary_core::StoreSessionRecord;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::SESSION_TABLE;
use crate::dao::classify;
use crate::dao::from_db_id;
use crate::dao::to_db_id;

// ============================================================================
// SECTION: Insert
// ============================================================================

/// Inserts a store-session row.
///
/// When the new row is current, the broker's previous current session is
/// demoted first so at most one current session exists per broker in
/// non-partitioned mode.
///
/// # Errors
///
/// Returns `Conflict` when the identifier already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, record: &StoreSessionRecord) -> Result<(), StoreFault> {
    if record.is_current {
        let demote = format!(
            "UPDATE {SESSION_TABLE} SET is_current = 0 WHERE broker_id = ?1 AND is_current = 1"
        );
        conn.execute(&demote, params![record.broker.as_str()])
            .map_err(|err| classify("demote previous session", &err))?;
    }
    let sql = format!(
        "INSERT INTO {SESSION_TABLE} (id, broker_id, is_current, created_by, created_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5)"
    );
    conn.execute(
        &sql,
        params![
            to_db_id(record.id.get())?,
            record.broker.as_str(),
            i64::from(record.is_current),
            record.created_by,
            record.created_at,
        ],
    )
    .map_err(|err| classify("insert store session", &err))?;
    Ok(())
}

// ============================================================================
// SECTION: Ownership Transfer
// ============================================================================

/// Reassigns every session of `target` to `new_owner`.
///
/// Reassigned sessions are demoted to non-current: the new owner already
/// has its own current session and serves the inherited ones passively.
/// Returns the reassigned session identifiers.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn takeover_sessions(
    conn: &Connection,
    target: &BrokerId,
    new_owner: &BrokerId,
) -> Result<Vec<SessionId>, StoreFault> {
    let list_sql = format!("SELECT id FROM {SESSION_TABLE} WHERE broker_id = ?1");
    let mut stmt = conn.prepare(&list_sql).map_err(|err| classify("list target sessions", &err))?;
    let rows = stmt
        .query_map(params![target.as_str()], |row| {
            let raw: i64 = row.get(0)?;
            Ok(raw)
        })
        .map_err(|err| classify("list target sessions", &err))?;
    let mut sessions = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list target sessions", &err))?;
        sessions.push(SessionId::new(from_db_id(raw)?));
    }
    let sql = format!(
        "UPDATE {SESSION_TABLE} SET broker_id = ?1, is_current = 0 WHERE broker_id = ?2"
    );
    conn.execute(&sql, params![new_owner.as_str(), target.as_str()])
        .map_err(|err| classify("reassign sessions", &err))?;
    Ok(sessions)
}

/// Moves one session from its current owner to another broker.
///
/// Partition migration path: CAS on the current owner so a racing move
/// conflicts.
///
/// # Errors
///
/// Returns `NotFound` when the session is absent, `Conflict` when `from`
/// no longer owns it, or a classified driver fault.
pub fn move_session(
    conn: &Connection,
    session: SessionId,
    from: &BrokerId,
    to: &BrokerId,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {SESSION_TABLE} SET broker_id = ?1, is_current = 0 \
         WHERE id = ?2 AND broker_id = ?3"
    );
    let updated = conn
        .execute(&sql, params![to.as_str(), to_db_id(session.get())?, from.as_str()])
        .map_err(|err| classify("move store session", &err))?;
    if updated == 0 {
        let owner = get_owner_opt(conn, session)?;
        return match owner {
            None => Err(StoreFault::not_found(format!("store session {session} does not exist"))),
            Some(actual) => Err(StoreFault::conflict(format!(
                "store session {session} is owned by {actual}, not {from}"
            ))),
        };
    }
    Ok(())
}

// ============================================================================
// SECTION: Queries & Delete
// ============================================================================

/// Loads the owning broker of a session.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get_owner(conn: &Connection, session: SessionId) -> Result<BrokerId, StoreFault> {
    get_owner_opt(conn, session)?
        .ok_or_else(|| StoreFault::not_found(format!("store session {session} does not exist")))
}

/// Loads the owning broker, `None` when the session is absent.
fn get_owner_opt(conn: &Connection, session: SessionId) -> Result<Option<BrokerId>, StoreFault> {
    let sql = format!("SELECT broker_id FROM {SESSION_TABLE} WHERE id = ?1");
    let owner: Option<String> = conn
        .query_row(&sql, params![to_db_id(session.get())?], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load session owner", &err))?;
    Ok(owner.map(BrokerId::new))
}

/// Lists every session owned by a broker.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_sessions_by_broker(
    conn: &Connection,
    broker: &BrokerId,
) -> Result<Vec<StoreSessionRecord>, StoreFault> {
    let sql = format!(
        "SELECT id, broker_id, is_current, created_by, created_ts \
         FROM {SESSION_TABLE} WHERE broker_id = ?1 ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list broker sessions", &err))?;
    let rows = stmt
        .query_map(params![broker.as_str()], |row| {
            let id: i64 = row.get(0)?;
            let owner: String = row.get(1)?;
            let is_current: i64 = row.get(2)?;
            let created_by: String = row.get(3)?;
            let created_at: i64 = row.get(4)?;
            Ok((id, owner, is_current, created_by, created_at))
        })
        .map_err(|err| classify("list broker sessions", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let (id, owner, is_current, created_by, created_at) =
            row.map_err(|err| classify("list broker sessions", &err))?;
        records.push(StoreSessionRecord {
            id: SessionId::new(from_db_id(id)?),
            broker: BrokerId::new(owner),
            is_current: is_current != 0,
            created_by,
            created_at,
        });
    }
    Ok(records)
}

/// Loads every session row.
///
/// Backup/dump path only.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<StoreSessionRecord>, StoreFault> {
    let sql = format!(
        "SELECT id, broker_id, is_current, created_by, created_ts \
         FROM {SESSION_TABLE} ORDER BY id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("scan sessions", &err))?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let owner: String = row.get(1)?;
            let is_current: i64 = row.get(2)?;
            let created_by: String = row.get(3)?;
            let created_at: i64 = row.get(4)?;
            Ok((id, owner, is_current, created_by, created_at))
        })
        .map_err(|err| classify("scan sessions", &err))?;
    let mut records = Vec::new();
    for row in rows {
        let (id, owner, is_current, created_by, created_at) =
            row.map_err(|err| classify("scan sessions", &err))?;
        records.push(StoreSessionRecord {
            id: SessionId::new(from_db_id(id)?),
            broker: BrokerId::new(owner),
            is_current: is_current != 0,
            created_by,
            created_at,
        });
    }
    Ok(records)
}

/// Loads a broker's current session, `None` when it has none.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_current_session(
    conn: &Connection,
    broker: &BrokerId,
) -> Result<Option<SessionId>, StoreFault> {
    let sql = format!(
        "SELECT id FROM {SESSION_TABLE} WHERE broker_id = ?1 AND is_current = 1 LIMIT 1"
    );
    let raw: Option<i64> = conn
        .query_row(&sql, params![broker.as_str()], |row| row.get(0))
        .optional()
        .map_err(|err| classify("load current session", &err))?;
    raw.map(|value| Ok(SessionId::new(from_db_id(value)?))).transpose()
}

/// Deletes every session owned by a broker, returning the count removed.
///
/// Administrative path used by broker removal after the sessions' data
/// has been migrated or discarded.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn delete_by_broker(conn: &Connection, broker: &BrokerId) -> Result<u64, StoreFault> {
    let sql = format!("DELETE FROM {SESSION_TABLE} WHERE broker_id = ?1");
    let deleted = conn
        .execute(&sql, params![broker.as_str()])
        .map_err(|err| classify("delete broker sessions", &err))?;
    Ok(u64::try_from(deleted).unwrap_or(u64::MAX))
}
