// crates/granary-store/src/dao/broker.rs
// ============================================================================
// Module: Broker DAO
// Description: Statements against the broker membership table.
// Purpose: Heartbeats, lifecycle state CAS updates, and the optimistic
//          takeover lock that fences HA failover.
// Dependencies: granary-core, rusqlite, crate::dao
// ============================================================================

//! ## Overview
//! The broker row is the HA fencing point. All state changes are
//! compare-and-swap UPDATEs keyed on the expected state (and, for the
//! takeover lock, the expected heartbeat): zero rows updated means the row
//! moved underneath the caller and the operation is diagnosed by
//! re-reading, never blindly retried.
//!
//! Acquiring the takeover lock snapshots the target row first; a failed
//! takeover compensates by restoring exactly that snapshot.

// ============================================================================
// SECTION: Imports
// ============================================================================

use granary_core::BrokerId;
use granary_core::BrokerInfo;
use granary_core::BrokerState;
use granary_core::SessionId;
use granary_core::StoreFault;
use granary_core::TakeoverSnapshot;
use rusqlite::Connection;
use rusqlite::OptionalExtension;
use rusqlite::params;

use crate::dao::BROKER_TABLE;
use crate::dao::SESSION_TABLE;
use crate::dao::classify;
use crate::dao::from_db_id;
use crate::dao::now_millis;

// ============================================================================
// SECTION: Insert & Upsert
// ============================================================================

/// Inserts a broker membership row.
///
/// # Errors
///
/// Returns `Conflict` when the identifier already exists, or a classified
/// driver fault.
pub fn insert(conn: &Connection, info: &BrokerInfo) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {BROKER_TABLE} (id, url, version, state, takeover_broker, heartbeat_ts) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)"
    );
    conn.execute(
        &sql,
        params![
            info.id.as_str(),
            info.url,
            i64::from(info.version),
            info.state.code(),
            info.takeover_broker.as_ref().map(BrokerId::as_str),
            info.heartbeat_at,
        ],
    )
    .map_err(|err| classify("insert broker", &err))?;
    Ok(())
}

/// Inserts or refreshes a broker row at startup.
///
/// URL and version are overwritten; the state and heartbeat are reset so
/// the broker re-announces itself as initializing.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn upsert(conn: &Connection, info: &BrokerInfo) -> Result<(), StoreFault> {
    let sql = format!(
        "INSERT INTO {BROKER_TABLE} (id, url, version, state, takeover_broker, heartbeat_ts) \
         VALUES (?1, ?2, ?3, ?4, NULL, ?5) \
         ON CONFLICT (id) DO UPDATE SET \
         url = excluded.url, version = excluded.version, state = excluded.state, \
         takeover_broker = NULL, heartbeat_ts = excluded.heartbeat_ts"
    );
    conn.execute(
        &sql,
        params![
            info.id.as_str(),
            info.url,
            i64::from(info.version),
            info.state.code(),
            info.heartbeat_at,
        ],
    )
    .map_err(|err| classify("upsert broker", &err))?;
    Ok(())
}

// ============================================================================
// SECTION: Heartbeat
// ============================================================================

/// Refreshes a broker's heartbeat unconditionally.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_heartbeat(conn: &Connection, id: &BrokerId, heartbeat_at: i64) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {BROKER_TABLE} SET heartbeat_ts = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![heartbeat_at, id.as_str()])
        .map_err(|err| classify("update heartbeat", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("broker {id} does not exist")));
    }
    Ok(())
}

/// Refreshes a broker's heartbeat only if the stored value still matches.
///
/// Returns `false` on a mismatch: another writer (a takeover in progress)
/// moved the row, and the caller must re-read before acting.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_heartbeat_expected(
    conn: &Connection,
    id: &BrokerId,
    expected: i64,
    heartbeat_at: i64,
) -> Result<bool, StoreFault> {
    let sql = format!(
        "UPDATE {BROKER_TABLE} SET heartbeat_ts = ?1 WHERE id = ?2 AND heartbeat_ts = ?3"
    );
    let updated = conn
        .execute(&sql, params![heartbeat_at, id.as_str(), expected])
        .map_err(|err| classify("update heartbeat (expected)", &err))?;
    if updated == 0 {
        if get_info_opt(conn, id)?.is_none() {
            return Err(StoreFault::not_found(format!("broker {id} does not exist")));
        }
        return Ok(false);
    }
    Ok(true)
}

// ============================================================================
// SECTION: State Transitions
// ============================================================================

/// Moves this broker's own row through a lifecycle transition, CAS on the
/// expected state.
///
/// # Errors
///
/// Returns `OwnershipLost` when another broker holds or held the takeover
/// lock on the row, `PreconditionFailed` on a state mismatch, `NotFound`
/// when absent, or a classified driver fault.
pub fn update_state_this_broker(
    conn: &Connection,
    id: &BrokerId,
    expected: BrokerState,
    state: BrokerState,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {BROKER_TABLE} SET state = ?1 \
         WHERE id = ?2 AND state = ?3 AND takeover_broker IS NULL"
    );
    let updated = conn
        .execute(&sql, params![state.code(), id.as_str(), expected.code()])
        .map_err(|err| classify("update broker state", &err))?;
    if updated == 0 {
        let info = get_info_opt(conn, id)?
            .ok_or_else(|| StoreFault::not_found(format!("broker {id} does not exist")))?;
        if info.takeover_broker.is_some() || info.state.is_failover() {
            return Err(StoreFault::ownership_lost(format!(
                "broker {id} is being taken over"
            )));
        }
        return Err(StoreFault::precondition(format!(
            "broker {id} is {:?}, expected {expected:?}",
            info.state
        )));
    }
    Ok(())
}

/// Moves another broker's row through a lifecycle transition.
///
/// Used by administrative paths and by the takeover finish (the lock
/// holder flips the target to its terminal failover state).
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn update_state_other_broker(
    conn: &Connection,
    id: &BrokerId,
    state: BrokerState,
) -> Result<(), StoreFault> {
    let sql = format!("UPDATE {BROKER_TABLE} SET state = ?1 WHERE id = ?2");
    let updated = conn
        .execute(&sql, params![state.code(), id.as_str()])
        .map_err(|err| classify("update broker state (other)", &err))?;
    if updated == 0 {
        return Err(StoreFault::not_found(format!("broker {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Takeover Lock
// ============================================================================

/// Acquires the takeover lock on a target broker row.
///
/// Single optimistic UPDATE expecting both the observed state and the
/// observed heartbeat; zero rows updated means another broker won the
/// race (or the target resumed), and the caller must not proceed.
///
/// On success the returned snapshot holds the target row exactly as it
/// was, for compensation if the takeover later fails.
///
/// # Errors
///
/// Returns `Conflict` on a lost race, `NotFound` when the target row is
/// absent, or a classified driver fault.
pub fn takeover(
    conn: &Connection,
    target: &BrokerId,
    new_owner: &BrokerId,
    expected_state: BrokerState,
    expected_heartbeat: i64,
) -> Result<TakeoverSnapshot, StoreFault> {
    let saved = get_info_opt(conn, target)?
        .ok_or_else(|| StoreFault::not_found(format!("broker {target} does not exist")))?;
    let sql = format!(
        "UPDATE {BROKER_TABLE} SET state = ?1, takeover_broker = ?2 \
         WHERE id = ?3 AND state = ?4 AND heartbeat_ts = ?5 AND takeover_broker IS NULL"
    );
    let updated = conn
        .execute(
            &sql,
            params![
                BrokerState::FailoverStarted.code(),
                new_owner.as_str(),
                target.as_str(),
                expected_state.code(),
                expected_heartbeat,
            ],
        )
        .map_err(|err| classify("acquire takeover lock", &err))?;
    if updated == 0 {
        return Err(StoreFault::conflict(format!(
            "takeover lock on broker {target} lost: row changed since observation"
        )));
    }
    Ok(TakeoverSnapshot {
        saved,
        locked_at: now_millis(),
    })
}

/// Restores the target row from its takeover snapshot.
///
/// Compensation path for a failed takeover: state, heartbeat, and the
/// takeover marker revert to their pre-lock values, but only while this
/// owner still holds the lock.
///
/// # Errors
///
/// Returns `Conflict` when the lock is no longer held by `owner`, or a
/// classified driver fault.
pub fn restore_from_snapshot(
    conn: &Connection,
    target: &BrokerId,
    owner: &BrokerId,
    snapshot: &TakeoverSnapshot,
) -> Result<(), StoreFault> {
    let sql = format!(
        "UPDATE {BROKER_TABLE} SET state = ?1, heartbeat_ts = ?2, takeover_broker = ?3 \
         WHERE id = ?4 AND takeover_broker = ?5"
    );
    let updated = conn
        .execute(
            &sql,
            params![
                snapshot.saved.state.code(),
                snapshot.saved.heartbeat_at,
                snapshot.saved.takeover_broker.as_ref().map(BrokerId::as_str),
                target.as_str(),
                owner.as_str(),
            ],
        )
        .map_err(|err| classify("restore takeover snapshot", &err))?;
    if updated == 0 {
        return Err(StoreFault::conflict(format!(
            "takeover lock on broker {target} is no longer held by {owner}"
        )));
    }
    Ok(())
}

/// Reports whether another broker holds or has held the takeover lock.
///
/// # Errors
///
/// Returns `NotFound` when the row is absent, or a classified driver
/// fault.
pub fn is_being_taken_over(conn: &Connection, id: &BrokerId) -> Result<bool, StoreFault> {
    let info = get_info_opt(conn, id)?
        .ok_or_else(|| StoreFault::not_found(format!("broker {id} does not exist")))?;
    Ok(info.takeover_broker.is_some() || info.state.is_failover())
}

// ============================================================================
// SECTION: Queries & Delete
// ============================================================================

/// Loads one broker row.
///
/// # Errors
///
/// Returns `NotFound` when absent, or a classified driver fault.
pub fn get_info(conn: &Connection, id: &BrokerId) -> Result<BrokerInfo, StoreFault> {
    get_info_opt(conn, id)?
        .ok_or_else(|| StoreFault::not_found(format!("broker {id} does not exist")))
}

/// Loads one broker row, `None` when absent.
fn get_info_opt(conn: &Connection, id: &BrokerId) -> Result<Option<BrokerInfo>, StoreFault> {
    let sql = format!(
        "SELECT bkr.id, bkr.url, bkr.version, bkr.state, bkr.takeover_broker, bkr.heartbeat_ts, \
         (SELECT ses.id FROM {SESSION_TABLE} ses \
          WHERE ses.broker_id = bkr.id AND ses.is_current = 1 LIMIT 1) \
         FROM {BROKER_TABLE} bkr WHERE bkr.id = ?1"
    );
    let row = conn
        .query_row(&sql, params![id.as_str()], map_broker_row)
        .optional()
        .map_err(|err| classify("load broker", &err))?;
    row.map(RawBrokerRow::into_record).transpose()
}

/// Loads every broker row.
///
/// # Errors
///
/// Returns a classified driver fault on failure.
pub fn get_all(conn: &Connection) -> Result<Vec<BrokerInfo>, StoreFault> {
    let sql = format!(
        "SELECT bkr.id, bkr.url, bkr.version, bkr.state, bkr.takeover_broker, bkr.heartbeat_ts, \
         (SELECT ses.id FROM {SESSION_TABLE} ses \
          WHERE ses.broker_id = bkr.id AND ses.is_current = 1 LIMIT 1) \
         FROM {BROKER_TABLE} bkr ORDER BY bkr.id"
    );
    let mut stmt = conn.prepare(&sql).map_err(|err| classify("list brokers", &err))?;
    let rows = stmt
        .query_map([], map_broker_row)
        .map_err(|err| classify("list brokers", &err))?;
    let mut brokers = Vec::new();
    for row in rows {
        let raw = row.map_err(|err| classify("list brokers", &err))?;
        brokers.push(raw.into_record()?);
    }
    Ok(brokers)
}

/// Deletes a broker row.
///
/// Administrative operation; refuses while the broker still owns store
/// sessions.
///
/// # Errors
///
/// Returns `Conflict` when sessions remain, `NotFound` when the row is
/// absent, or a classified driver fault.
pub fn delete(conn: &Connection, id: &BrokerId) -> Result<(), StoreFault> {
    let count_sql = format!("SELECT COUNT(*) FROM {SESSION_TABLE} WHERE broker_id = ?1");
    let sessions: i64 = conn
        .query_row(&count_sql, params![id.as_str()], |row| row.get(0))
        .map_err(|err| classify("count broker sessions", &err))?;
    if sessions > 0 {
        return Err(StoreFault::conflict(format!(
            "broker {id} still owns {sessions} store session(s)"
        )));
    }
    let sql = format!("DELETE FROM {BROKER_TABLE} WHERE id = ?1");
    let deleted = conn
        .execute(&sql, params![id.as_str()])
        .map_err(|err| classify("delete broker", &err))?;
    if deleted == 0 {
        return Err(StoreFault::not_found(format!("broker {id} does not exist")));
    }
    Ok(())
}

// ============================================================================
// SECTION: Row Mapping
// ============================================================================

/// Raw broker row prior to identifier conversion.
struct RawBrokerRow {
    /// Broker identifier column.
    id: String,
    /// Service URL column.
    url: String,
    /// Version column.
    version: i64,
    /// Lifecycle state column.
    state: i64,
    /// Takeover marker column.
    takeover_broker: Option<String>,
    /// Heartbeat timestamp column.
    heartbeat_at: i64,
    /// Current-session sub-query column.
    session: Option<i64>,
}

impl RawBrokerRow {
    /// Converts raw columns into a [`BrokerInfo`].
    fn into_record(self) -> Result<BrokerInfo, StoreFault> {
        Ok(BrokerInfo {
            id: BrokerId::new(self.id),
            url: self.url,
            version: u32::try_from(self.version)
                .map_err(|_| StoreFault::other(format!("broker version {} out of range", self.version)))?,
            state: BrokerState::from_code(self.state)
                .ok_or_else(|| StoreFault::other(format!("unknown broker state code {}", self.state)))?,
            session: self
                .session
                .map(|raw| Ok::<_, StoreFault>(SessionId::new(from_db_id(raw)?)))
                .transpose()?,
            heartbeat_at: self.heartbeat_at,
            takeover_broker: self.takeover_broker.map(BrokerId::new),
        })
    }
}

/// Maps a full broker row into its raw column form.
fn map_broker_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawBrokerRow> {
    Ok(RawBrokerRow {
        id: row.get(0)?,
        url: row.get(1)?,
        version: row.get(2)?,
        state: row.get(3)?,
        takeover_broker: row.get(4)?,
        heartbeat_at: row.get(5)?,
        session: row.get(6)?,
    })
}
