// crates/granary-store/src/backup.rs
// ============================================================================
// Module: Backup & Restore
// Description: JSON-lines export and import of every logical table.
// Purpose: Move a store's contents through a portable file-based form for
//          migration between backends and disaster recovery.
// Dependencies: granary-core, rusqlite, serde, serde_json, crate::dao
// ============================================================================

//! ## Overview
//! Each logical table is written to one `.jsonl` file in the backup
//! directory, one serialized record per line, plus a `manifest.json`
//! carrying the schema version. The format is backend-neutral: identifiers
//! and descriptors serialize through their record types, so a backup can
//! be restored into any store speaking the same records.
//!
//! Restore expects freshly created tables and inserts through the DAOs so
//! every invariant check applies to restored rows too.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::fs::File;
use std::io::BufRead;
use std::io::BufReader;
use std::io::BufWriter;
use std::io::Write;
use std::path::Path;

use granary_core::StoreFault;
use rusqlite::Connection;
use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::dao::bridge_log;
use crate::dao::broker;
use crate::dao::config_record;
use crate::dao::consumer;
use crate::dao::consumer_state;
use crate::dao::destination;
use crate::dao::message;
use crate::dao::property;
use crate::dao::store_session;
use crate::dao::txn;
use crate::schema::STORE_VERSION;

// ============================================================================
// SECTION: File Layout
// ============================================================================

/// Manifest file name.
const MANIFEST_FILE: &str = "manifest.json";
/// Per-table file names, paired with their logical content.
const MESSAGES_FILE: &str = "messages.jsonl";
/// Consumer-state file name.
const CONSUMER_STATES_FILE: &str = "consumer_states.jsonl";
/// Transaction file name.
const TRANSACTIONS_FILE: &str = "transactions.jsonl";
/// Destination file name.
const DESTINATIONS_FILE: &str = "destinations.jsonl";
/// Durable-consumer file name.
const CONSUMERS_FILE: &str = "consumers.jsonl";
/// Broker membership file name.
const BROKERS_FILE: &str = "brokers.jsonl";
/// Store-session file name.
const SESSIONS_FILE: &str = "sessions.jsonl";
/// Property file name.
const PROPERTIES_FILE: &str = "properties.jsonl";
/// Config record file name.
const CONFIG_RECORDS_FILE: &str = "config_records.jsonl";
/// Bridge log file name.
const BRIDGE_LOGS_FILE: &str = "bridge_logs.jsonl";

/// Backup manifest.
#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    /// Schema version the backup was taken from.
    store_version: i64,
    /// Backup timestamp in unix milliseconds.
    created_at: i64,
}

/// Property record in its file form.
#[derive(Debug, Serialize, Deserialize)]
struct PropertyLine {
    /// Property name.
    name: String,
    /// Property value.
    value: serde_json::Value,
}

// ============================================================================
// SECTION: Backup
// ============================================================================

/// Writes every logical table to JSON-lines files under `dir`.
///
/// # Errors
///
/// Returns [`StoreFault`] on query or file-write failure.
pub fn backup_store(conn: &Connection, dir: &Path) -> Result<(), StoreFault> {
    fs::create_dir_all(dir)
        .map_err(|err| StoreFault::other(format!("create backup directory: {err}")))?;
    let manifest = Manifest {
        store_version: STORE_VERSION,
        created_at: crate::dao::now_millis(),
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|err| StoreFault::other(format!("encode manifest: {err}")))?;
    fs::write(dir.join(MANIFEST_FILE), manifest_json)
        .map_err(|err| StoreFault::other(format!("write manifest: {err}")))?;

    write_lines(dir, MESSAGES_FILE, &message::get_all(conn)?)?;
    write_lines(dir, CONSUMER_STATES_FILE, &consumer_state::get_all(conn)?)?;
    write_lines(dir, TRANSACTIONS_FILE, &txn::get_all(conn)?)?;
    write_lines(dir, DESTINATIONS_FILE, &destination::get_all(conn, None)?)?;
    write_lines(dir, CONSUMERS_FILE, &consumer::get_all(conn)?)?;
    write_lines(dir, BROKERS_FILE, &broker::get_all(conn)?)?;
    write_lines(dir, SESSIONS_FILE, &store_session::get_all(conn)?)?;
    let properties: Vec<PropertyLine> = property::get_all(conn)?
        .into_iter()
        .map(|(name, value)| PropertyLine {
            name,
            value,
        })
        .collect();
    write_lines(dir, PROPERTIES_FILE, &properties)?;
    write_lines(dir, CONFIG_RECORDS_FILE, &config_record::get_all(conn)?)?;
    write_lines(dir, BRIDGE_LOGS_FILE, &bridge_log::get_all(conn)?)?;
    Ok(())
}

// ============================================================================
// SECTION: Restore
// ============================================================================

/// Reads JSON-lines files under `dir` and inserts them through the DAOs.
///
/// Insert order follows table dependencies: destinations and sessions
/// before messages, messages before consumer states.
///
/// # Errors
///
/// Returns [`StoreFault`] on a missing or version-mismatched manifest,
/// file-read failure, or any insert fault.
pub fn restore_store(conn: &Connection, dir: &Path) -> Result<(), StoreFault> {
    let manifest_bytes = fs::read(dir.join(MANIFEST_FILE))
        .map_err(|err| StoreFault::other(format!("read manifest: {err}")))?;
    let manifest: Manifest = serde_json::from_slice(&manifest_bytes)
        .map_err(|err| StoreFault::other(format!("decode manifest: {err}")))?;
    if manifest.store_version != STORE_VERSION {
        return Err(StoreFault::conflict(format!(
            "backup holds store version {}, expected {STORE_VERSION}",
            manifest.store_version
        )));
    }

    for info in read_lines::<granary_core::BrokerInfo>(dir, BROKERS_FILE)? {
        broker::insert(conn, &info)?;
    }
    for session in read_lines::<granary_core::StoreSessionRecord>(dir, SESSIONS_FILE)? {
        store_session::insert(conn, &session)?;
    }
    for dst in read_lines::<granary_core::DestinationRecord>(dir, DESTINATIONS_FILE)? {
        destination::insert(conn, &dst)?;
    }
    for record in read_lines::<granary_core::ConsumerRecord>(dir, CONSUMERS_FILE)? {
        consumer::insert(conn, &record)?;
    }
    let restorer = granary_core::BrokerIdentity::standalone("restore", "restore");
    for record in read_lines::<granary_core::MessageRecord>(dir, MESSAGES_FILE)? {
        message::insert(conn, &restorer, &record, false)?;
    }
    for state in read_lines::<granary_core::ConsumerStateRecord>(dir, CONSUMER_STATES_FILE)? {
        consumer_state::insert(
            conn,
            &state.message,
            &[(state.consumer, state.state)],
            state.transaction,
            state.created_at,
        )?;
    }
    for record in read_lines::<granary_core::TransactionRecord>(dir, TRANSACTIONS_FILE)? {
        txn::insert(conn, &record)?;
    }
    for line in read_lines::<PropertyLine>(dir, PROPERTIES_FILE)? {
        property::put(conn, &line.name, &line.value)?;
    }
    for record in read_lines::<granary_core::ConfigChangeRecord>(dir, CONFIG_RECORDS_FILE)? {
        config_record::insert(conn, &record)?;
    }
    for record in read_lines::<granary_core::BridgeLogRecord>(dir, BRIDGE_LOGS_FILE)? {
        bridge_log::insert(conn, &record)?;
    }
    Ok(())
}

// ============================================================================
// SECTION: File Helpers
// ============================================================================

/// Writes one serialized record per line.
fn write_lines<T: Serialize>(dir: &Path, file: &str, records: &[T]) -> Result<(), StoreFault> {
    let path = dir.join(file);
    let handle =
        File::create(&path).map_err(|err| StoreFault::other(format!("create {file}: {err}")))?;
    let mut writer = BufWriter::new(handle);
    for record in records {
        let line = serde_json::to_string(record)
            .map_err(|err| StoreFault::other(format!("encode {file} record: {err}")))?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .map_err(|err| StoreFault::other(format!("write {file}: {err}")))?;
    }
    writer.flush().map_err(|err| StoreFault::other(format!("flush {file}: {err}")))
}

/// Reads one deserialized record per line; a missing file yields no rows.
fn read_lines<T: DeserializeOwned>(dir: &Path, file: &str) -> Result<Vec<T>, StoreFault> {
    let path = dir.join(file);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let handle =
        File::open(&path).map_err(|err| StoreFault::other(format!("open {file}: {err}")))?;
    let reader = BufReader::new(handle);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| StoreFault::other(format!("read {file}: {err}")))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .map_err(|err| StoreFault::other(format!("decode {file} record: {err}")))?;
        records.push(record);
    }
    Ok(records)
}
