// crates/granary-store/src/schema.rs
// ============================================================================
// Module: Schema Manager
// Description: Table creation, upgrade, and the administrative table lock.
// Purpose: Manage the four schema states (no tables, current, old, both)
//          and resolve first-creator races at bootstrap.
// Dependencies: granary-core, rusqlite, rand, crate::dao
// ============================================================================

//! ## Overview
//! Tables are version-suffixed (`mqmsg50`); an upgrade copies rows from
//! the previous suffix in dependency order and leaves the old tables in
//! place for the operator to drop. When both generations exist, opening
//! the store logs a reminder and keeps serving from the current tables.
//!
//! Several brokers sharing one database may race to create tables at
//! first boot. The loser of the race sleeps a short randomized interval
//! and re-checks: finding the tables created by the winner is success.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use granary_core::LogEvent;
use granary_core::LogSink;
use granary_core::Severity;
use granary_core::StoreFault;
use rand::Rng;
use rusqlite::Connection;

use crate::dao;
use crate::dao::classify;
use crate::dao::version;

// ============================================================================
// SECTION: Constants
// ============================================================================

/// Current store schema version; matches the table suffix.
pub const STORE_VERSION: i64 = 50;
/// Previous schema version recognized by the upgrade path.
pub const OLD_STORE_VERSION: i64 = 41;
/// Lower bound of the randomized bootstrap race backoff (ms).
const RACE_BACKOFF_MIN_MS: u64 = 100;
/// Upper bound of the randomized bootstrap race backoff (ms).
const RACE_BACKOFF_MAX_MS: u64 = 1_500;

/// DDL for every current-generation table, in creation order.
const CREATE_TABLES_SQL: &str = "\
CREATE TABLE mqversion50 (
    store_version INTEGER NOT NULL,
    lock_id TEXT
);
CREATE TABLE mqbroker50 (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    version INTEGER NOT NULL,
    state INTEGER NOT NULL,
    takeover_broker TEXT,
    heartbeat_ts INTEGER NOT NULL
);
CREATE TABLE mqsession50 (
    id INTEGER PRIMARY KEY,
    broker_id TEXT NOT NULL,
    is_current INTEGER NOT NULL,
    created_by TEXT NOT NULL,
    created_ts INTEGER NOT NULL
);
CREATE INDEX idx_mqsession50_broker ON mqsession50 (broker_id);
CREATE TABLE mqdst50 (
    id TEXT PRIMARY KEY,
    descriptor BLOB NOT NULL,
    is_local INTEGER NOT NULL,
    connection_id INTEGER,
    store_session_id INTEGER,
    created_ts INTEGER NOT NULL,
    connected_ts INTEGER
);
CREATE INDEX idx_mqdst50_session ON mqdst50 (store_session_id);
CREATE TABLE mqconsumer50 (
    id INTEGER PRIMARY KEY,
    descriptor BLOB NOT NULL,
    durable_name TEXT,
    client_id TEXT,
    created_ts INTEGER NOT NULL
);
CREATE TABLE mqmsg50 (
    id TEXT PRIMARY KEY,
    size INTEGER NOT NULL,
    store_session_id INTEGER NOT NULL,
    dst_id TEXT NOT NULL,
    txn_id INTEGER,
    created_ts INTEGER NOT NULL,
    payload BLOB NOT NULL
);
CREATE INDEX idx_mqmsg50_dst ON mqmsg50 (dst_id, store_session_id);
CREATE INDEX idx_mqmsg50_session ON mqmsg50 (store_session_id);
CREATE TABLE mqconstate50 (
    msg_id TEXT NOT NULL,
    consumer_id INTEGER NOT NULL,
    state INTEGER NOT NULL,
    txn_id INTEGER,
    created_ts INTEGER NOT NULL,
    PRIMARY KEY (msg_id, consumer_id)
);
CREATE INDEX idx_mqconstate50_txn ON mqconstate50 (txn_id);
CREATE TABLE mqtxn50 (
    id INTEGER PRIMARY KEY,
    type INTEGER NOT NULL,
    state INTEGER NOT NULL,
    auto_rollback INTEGER NOT NULL,
    xid TEXT,
    txn_home_broker TEXT,
    txn_brokers BLOB,
    store_session_id INTEGER NOT NULL,
    expired_ts INTEGER NOT NULL,
    accessed_ts INTEGER NOT NULL
);
CREATE INDEX idx_mqtxn50_session ON mqtxn50 (store_session_id);
CREATE TABLE mqprop50 (
    name TEXT PRIMARY KEY,
    value BLOB NOT NULL
);
CREATE TABLE mqccrec50 (
    record_ts INTEGER NOT NULL,
    record BLOB NOT NULL
);
CREATE TABLE mqbridgelog50 (
    xid TEXT NOT NULL,
    log_record BLOB NOT NULL,
    name TEXT NOT NULL,
    broker_id TEXT NOT NULL,
    created_ts INTEGER NOT NULL,
    updated_ts INTEGER NOT NULL,
    PRIMARY KEY (xid, name)
);
";

/// Copy statements for the upgrade path, in dependency order
/// (referenced tables before referencing ones).
const UPGRADE_COPY_SQL: [(&str, &str); 8] = [
    ("mqdst41", "INSERT INTO mqdst50 SELECT * FROM mqdst41"),
    ("mqconsumer41", "INSERT INTO mqconsumer50 SELECT * FROM mqconsumer41"),
    ("mqmsg41", "INSERT INTO mqmsg50 SELECT * FROM mqmsg41"),
    ("mqconstate41", "INSERT INTO mqconstate50 SELECT * FROM mqconstate41"),
    ("mqtxn41", "INSERT INTO mqtxn50 SELECT * FROM mqtxn41"),
    ("mqprop41", "INSERT INTO mqprop50 SELECT * FROM mqprop41"),
    ("mqccrec41", "INSERT INTO mqccrec50 SELECT * FROM mqccrec41"),
    ("mqbridgelog41", "INSERT INTO mqbridgelog50 SELECT * FROM mqbridgelog41"),
];

// ============================================================================
// SECTION: Table State
// ============================================================================

/// Which schema generations exist in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableState {
    /// No store tables exist.
    Missing,
    /// Only the current generation exists.
    Current,
    /// Only an old generation exists; an upgrade is required.
    Old,
    /// Both generations exist; the old one awaits operator cleanup.
    Both,
}

// ============================================================================
// SECTION: Schema Manager
// ============================================================================

/// Creates, upgrades, and locks the store schema.
///
/// # Invariants
/// - Old-generation tables are never dropped implicitly.
pub struct SchemaManager {
    /// Logging sink for schema events.
    log: Arc<dyn LogSink>,
}

impl SchemaManager {
    /// Creates a schema manager.
    #[must_use]
    pub fn new(log: Arc<dyn LogSink>) -> Self {
        Self {
            log,
        }
    }

    /// Reports which schema generations exist.
    ///
    /// # Errors
    ///
    /// Returns a classified driver fault on failure.
    pub fn table_state(&self, conn: &Connection) -> Result<TableState, StoreFault> {
        let current = table_exists(conn, dao::VERSION_TABLE)?;
        let old = table_exists(conn, &old_table_name(dao::VERSION_TABLE))?;
        Ok(match (current, old) {
            (false, false) => TableState::Missing,
            (true, false) => TableState::Current,
            (false, true) => TableState::Old,
            (true, true) => TableState::Both,
        })
    }

    /// Creates the current-generation tables and the version row.
    ///
    /// A creation race against another broker resolves by a randomized
    /// short sleep and a re-check: tables created by the winner count as
    /// success.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` when the tables already exist, or a classified
    /// driver fault.
    pub fn create_tables(&self, conn: &Connection) -> Result<(), StoreFault> {
        match self.table_state(conn)? {
            TableState::Current | TableState::Both => {
                return Err(StoreFault::conflict("store tables already exist"));
            }
            TableState::Missing | TableState::Old => {}
        }
        if let Err(err) = conn.execute_batch(CREATE_TABLES_SQL) {
            let backoff = rand::thread_rng().gen_range(RACE_BACKOFF_MIN_MS ..= RACE_BACKOFF_MAX_MS);
            thread::sleep(Duration::from_millis(backoff));
            if matches!(self.table_state(conn)?, TableState::Current | TableState::Both) {
                self.log.log(LogEvent::new(
                    Severity::Info,
                    "schema.race",
                    "another broker created the store tables first",
                ));
                return Ok(());
            }
            return Err(classify("create tables", &err));
        }
        version::insert(conn, STORE_VERSION)?;
        self.log.log(LogEvent::new(Severity::Info, "schema.created", "store tables created"));
        Ok(())
    }

    /// Ensures tables exist at store open, per the implicit-create policy.
    ///
    /// Both-generations logs a cleanup reminder and continues on the
    /// current tables; an old-only store refuses to open until upgraded.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when tables are missing and implicit creation
    /// is disabled, `Conflict` for an old-only or version-mismatched
    /// store, or a classified driver fault.
    pub fn ensure_tables(&self, conn: &Connection, create_missing: bool) -> Result<(), StoreFault> {
        match self.table_state(conn)? {
            TableState::Current => {}
            TableState::Both => {
                self.log.log(LogEvent::new(
                    Severity::Warning,
                    "schema.old_tables_present",
                    format!(
                        "version {OLD_STORE_VERSION} tables still exist; \
                         drop them once the upgrade has been verified"
                    ),
                ));
            }
            TableState::Missing => {
                if !create_missing {
                    return Err(StoreFault::not_found(
                        "store tables do not exist; run the create command first",
                    ));
                }
                self.create_tables(conn)?;
            }
            TableState::Old => {
                return Err(StoreFault::conflict(format!(
                    "store holds version {OLD_STORE_VERSION} tables; run the upgrade command"
                )));
            }
        }
        let stored = version::get_version(conn)?
            .ok_or_else(|| StoreFault::other("version table exists but holds no row"))?;
        if stored != STORE_VERSION {
            return Err(StoreFault::conflict(format!(
                "store version {stored} does not match supported version {STORE_VERSION}"
            )));
        }
        Ok(())
    }

    /// Drops every current-generation table.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no tables exist, or a classified driver
    /// fault.
    pub fn drop_tables(&self, conn: &Connection) -> Result<(), StoreFault> {
        if matches!(self.table_state(conn)?, TableState::Missing | TableState::Old) {
            return Err(StoreFault::not_found("store tables do not exist"));
        }
        for table in dao::ALL_TABLES.iter().rev() {
            let sql = format!("DROP TABLE IF EXISTS {table}");
            conn.execute_batch(&sql).map_err(|err| classify("drop tables", &err))?;
        }
        self.log.log(LogEvent::new(Severity::Info, "schema.dropped", "store tables dropped"));
        Ok(())
    }

    /// Drops tables whose names match a SQL LIKE pattern.
    ///
    /// Administrative escape hatch for orphaned generations; only names
    /// with the store's `mq` prefix are considered.
    ///
    /// Returns the dropped table names.
    ///
    /// # Errors
    ///
    /// Returns a classified driver fault on failure.
    pub fn drop_tables_by_pattern(
        &self,
        conn: &Connection,
        pattern: &str,
    ) -> Result<Vec<String>, StoreFault> {
        let mut stmt = conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name LIKE 'mq%' AND name LIKE ?1",
            )
            .map_err(|err| classify("list tables", &err))?;
        let rows = stmt
            .query_map([pattern], |row| {
                let name: String = row.get(0)?;
                Ok(name)
            })
            .map_err(|err| classify("list tables", &err))?;
        let names =
            rows.collect::<Result<Vec<_>, _>>().map_err(|err| classify("list tables", &err))?;
        for name in &names {
            let sql = format!("DROP TABLE IF EXISTS {name}");
            conn.execute_batch(&sql).map_err(|err| classify("drop tables by pattern", &err))?;
        }
        Ok(names)
    }

    /// Drops and recreates the current-generation tables.
    ///
    /// # Errors
    ///
    /// Returns a classified driver fault on failure.
    pub fn recreate(&self, conn: &Connection) -> Result<(), StoreFault> {
        if matches!(self.table_state(conn)?, TableState::Current | TableState::Both) {
            self.drop_tables(conn)?;
        }
        self.create_tables(conn)
    }

    /// Upgrades an old-generation store to the current generation.
    ///
    /// Creates the current tables, copies rows in dependency order, and
    /// leaves the old tables in place for the operator to drop after
    /// verification.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when no old tables exist, `Conflict` when the
    /// current tables already exist, or a classified driver fault.
    pub fn upgrade_store(&self, conn: &Connection) -> Result<(), StoreFault> {
        match self.table_state(conn)? {
            TableState::Old => {}
            TableState::Missing => {
                return Err(StoreFault::not_found("no old-generation tables to upgrade"));
            }
            TableState::Current | TableState::Both => {
                return Err(StoreFault::conflict("current-generation tables already exist"));
            }
        }
        conn.execute_batch(CREATE_TABLES_SQL).map_err(|err| classify("create tables", &err))?;
        for (old_table, copy_sql) in UPGRADE_COPY_SQL {
            if !table_exists(conn, old_table)? {
                continue;
            }
            conn.execute_batch(copy_sql)
                .map_err(|err| classify("copy rows during upgrade", &err))?;
        }
        version::insert(conn, STORE_VERSION)?;
        self.log.log(LogEvent::new(
            Severity::Info,
            "schema.upgraded",
            format!(
                "store upgraded from version {OLD_STORE_VERSION} to {STORE_VERSION}; \
                 old tables left in place for verification"
            ),
        ));
        Ok(())
    }
}

// ============================================================================
// SECTION: Helpers
// ============================================================================

/// Reports whether a table exists.
fn table_exists(conn: &Connection, name: &str) -> Result<bool, StoreFault> {
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [name],
            |row| row.get(0),
        )
        .map_err(|err| classify("check table exists", &err))?;
    Ok(count > 0)
}

/// Maps a current-generation table name to its old-generation name.
fn old_table_name(current: &str) -> String {
    current.replace("50", "41")
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use granary_core::MemoryLogSink;

    use super::*;

    fn test_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn manager() -> SchemaManager {
        SchemaManager::new(Arc::new(MemoryLogSink::new()))
    }

    #[test]
    fn create_then_state_is_current() {
        let conn = test_conn();
        let schema = manager();
        assert_eq!(schema.table_state(&conn).unwrap(), TableState::Missing);
        schema.create_tables(&conn).unwrap();
        assert_eq!(schema.table_state(&conn).unwrap(), TableState::Current);
        assert_eq!(version::get_version(&conn).unwrap(), Some(STORE_VERSION));
    }

    #[test]
    fn double_create_conflicts() {
        let conn = test_conn();
        let schema = manager();
        schema.create_tables(&conn).unwrap();
        let err = schema.create_tables(&conn).unwrap_err();
        assert_eq!(err.kind(), granary_core::FaultKind::Conflict);
    }

    #[test]
    fn ensure_tables_creates_when_allowed() {
        let conn = test_conn();
        let schema = manager();
        schema.ensure_tables(&conn, true).unwrap();
        assert_eq!(schema.table_state(&conn).unwrap(), TableState::Current);
    }

    #[test]
    fn ensure_tables_refuses_when_missing_and_disallowed() {
        let conn = test_conn();
        let schema = manager();
        let err = schema.ensure_tables(&conn, false).unwrap_err();
        assert_eq!(err.kind(), granary_core::FaultKind::NotFound);
    }

    #[test]
    fn drop_then_state_is_missing() {
        let conn = test_conn();
        let schema = manager();
        schema.create_tables(&conn).unwrap();
        schema.drop_tables(&conn).unwrap();
        assert_eq!(schema.table_state(&conn).unwrap(), TableState::Missing);
    }

    #[test]
    fn pattern_drop_only_touches_store_prefix() {
        let conn = test_conn();
        let schema = manager();
        schema.create_tables(&conn).unwrap();
        conn.execute_batch("CREATE TABLE unrelated (x INTEGER)").unwrap();
        let dropped = schema.drop_tables_by_pattern(&conn, "%prop%").unwrap();
        assert_eq!(dropped, vec!["mqprop50".to_string()]);
        assert!(table_exists(&conn, "unrelated").unwrap());
    }

    #[test]
    fn table_lock_round_trip() {
        let conn = test_conn();
        let schema = manager();
        schema.create_tables(&conn).unwrap();
        version::acquire_lock(&conn, "dbmgr@host-a").unwrap();
        // Re-entrant for the same holder.
        version::acquire_lock(&conn, "dbmgr@host-a").unwrap();
        let err = version::acquire_lock(&conn, "dbmgr@host-b").unwrap_err();
        assert_eq!(err.kind(), granary_core::FaultKind::Conflict);
        version::release_lock(&conn, "dbmgr@host-a").unwrap();
        version::acquire_lock(&conn, "dbmgr@host-b").unwrap();
        version::reset_lock(&conn).unwrap();
        assert_eq!(version::get_lock(&conn).unwrap(), None);
    }
}
