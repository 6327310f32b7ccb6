// crates/granary-cli/src/main.rs
// ============================================================================
// Module: Granary Database Manager Entry Point
// Description: Command dispatcher for store schema and data administration.
// Purpose: Create, upgrade, inspect, back up, and repair the message-store
//          database from the command line.
// Dependencies: clap, granary-core, granary-store, rusqlite, serde,
//               serde_json, thiserror, toml
// ============================================================================

//! ## Overview
//! `granary-dbmgr` operates directly on the store database while the
//! broker is down. Destructive commands take the store's administrative
//! table lock first so two operator sessions (or an operator racing a
//! starting broker) cannot interleave; a crashed session's stale lock is
//! cleared with `reset-lock`. All data access goes through the store's
//! DAO layer so every invariant check applies to administrative writes
//! too.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use granary_core::BrokerId;
use granary_core::LogEvent;
use granary_core::LogSink;
use granary_core::MessageId;
use granary_core::SessionId;
use granary_core::TransactionId;
use granary_store::DbPool;
use granary_store::SchemaManager;
use granary_store::StoreConfig;
use granary_store::backup;
use granary_store::dao;
use granary_store::dao::bridge_log;
use granary_store::dao::broker;
use granary_store::dao::config_record;
use granary_store::dao::consumer;
use granary_store::dao::consumer_state;
use granary_store::dao::destination;
use granary_store::dao::message;
use granary_store::dao::property;
use granary_store::dao::store_session;
use granary_store::dao::txn;
use granary_store::dao::version;
use rusqlite::Connection;
use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// SECTION: CLI Types
// ============================================================================

/// Top-level CLI definition.
#[derive(Parser, Debug)]
#[command(name = "granary-dbmgr", version, disable_help_subcommand = true)]
struct Cli {
    /// Path to a TOML configuration file with a `[store]` table.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    /// Path to the store database file (overrides the config file).
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,
    /// Selected subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the store tables.
    Create {
        /// Also create the database file and any missing parent directories.
        #[arg(long)]
        all: bool,
    },
    /// Drop the store tables and all data.
    Delete {
        /// Required confirmation flag.
        #[arg(long)]
        force: bool,
    },
    /// Drop and recreate the store tables.
    Recreate {
        /// Required confirmation flag.
        #[arg(long)]
        force: bool,
    },
    /// Upgrade an old-generation store to the current schema.
    Upgrade,
    /// Remove a broker's membership row and its store sessions.
    RemoveBroker {
        /// Broker identifier to remove.
        broker_id: String,
    },
    /// Remove every log record of one bridge service.
    RemoveBridge {
        /// Bridge service name.
        name: String,
    },
    /// Drop tables whose names match a SQL LIKE pattern.
    DropTables {
        /// Pattern, e.g. `%41` for a verified old generation.
        #[arg(long)]
        pattern: String,
    },
    /// Clear a stale administrative table lock.
    ResetLock,
    /// Print row counts for every logical table.
    Dump,
    /// Export every table to JSON-lines files.
    Backup {
        /// Target directory for the backup files.
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
    },
    /// Import a JSON-lines backup into freshly created tables.
    Restore {
        /// Directory holding the backup files.
        #[arg(long, value_name = "DIR")]
        dir: PathBuf,
    },
    /// Inspect individual store entities.
    Query {
        /// Selected query subcommand.
        #[command(subcommand)]
        command: QueryCommand,
    },
}

/// Entity inspection subcommands.
#[derive(Subcommand, Debug)]
enum QueryCommand {
    /// Print one broker membership row as JSON.
    Broker {
        /// Broker identifier.
        broker_id: String,
    },
    /// Print one message record as JSON.
    Message {
        /// System message identifier.
        message_id: String,
    },
    /// Print one transaction record as JSON.
    Transaction {
        /// Raw transaction identifier.
        transaction_id: u64,
    },
    /// Print one destination record as JSON.
    Destination {
        /// Destination identifier.
        destination_id: String,
    },
    /// Print the consumer states of one message as JSON.
    States {
        /// System message identifier.
        message_id: String,
    },
    /// Print the owner of one store session.
    Session {
        /// Raw store session identifier.
        session_id: u64,
    },
    /// Print the stored schema version and lock holder.
    Version,
}

// ============================================================================
// SECTION: Configuration
// ============================================================================

/// Configuration file layout.
#[derive(Debug, Deserialize)]
struct FileConfig {
    /// Store configuration table.
    store: StoreConfig,
}

/// Resolves the store configuration from `--config` and `--db`.
fn load_config(config: Option<&PathBuf>, db: Option<&PathBuf>) -> CliResult<StoreConfig> {
    let mut store = match config {
        Some(path) => {
            let text = fs::read_to_string(path)
                .map_err(|err| CliError::new(format!("read config {}: {err}", path.display())))?;
            let file: FileConfig = toml::from_str(&text)
                .map_err(|err| CliError::new(format!("parse config {}: {err}", path.display())))?;
            file.store
        }
        None => {
            let Some(db) = db else {
                return Err(CliError::new(
                    "no database given: pass --config <FILE> or --db <FILE>".to_string(),
                ));
            };
            StoreConfig::for_path(db)
        }
    };
    if let Some(db) = db {
        store.path = db.clone();
    }
    store.validate().map_err(|err| CliError::new(err.to_string()))?;
    Ok(store)
}

// ============================================================================
// SECTION: Errors
// ============================================================================

/// CLI error wrapper carrying a printable message.
#[derive(Debug, Error)]
#[error("{message}")]
struct CliError {
    /// Human-readable error message.
    message: String,
}

impl CliError {
    /// Constructs a new [`CliError`].
    const fn new(message: String) -> Self {
        Self {
            message,
        }
    }
}

impl From<granary_core::StoreFault> for CliError {
    fn from(fault: granary_core::StoreFault) -> Self {
        Self::new(fault.to_string())
    }
}

/// CLI result alias for fallible operations.
type CliResult<T> = Result<T, CliError>;

// ============================================================================
// SECTION: Logging
// ============================================================================

/// Log sink that writes one line per event to stderr.
struct StderrLogSink;

impl LogSink for StderrLogSink {
    fn log(&self, event: LogEvent) {
        let mut line = format!("{} [{}] {}", event.severity, event.code, event.message);
        for (key, value) in &event.context {
            line.push_str(&format!(" {key}={value}"));
        }
        let _ = write_stderr_line(&line);
    }
}

// ============================================================================
// SECTION: Entry Point
// ============================================================================

/// CLI entry point returning an exit code.
fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(err) => emit_error(&err.to_string()),
    }
}

/// Executes the CLI command dispatcher.
fn run() -> CliResult<ExitCode> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref(), cli.db.as_ref())?;
    if let Commands::Create {
        all: true,
    } = &cli.command
        && let Some(parent) = config.path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .map_err(|err| CliError::new(format!("create {}: {err}", parent.display())))?;
    }
    let pool = DbPool::open(&config)?;
    let schema = SchemaManager::new(std::sync::Arc::new(StderrLogSink));
    let conn = pool.connection()?;

    match cli.command {
        Commands::Create {
            ..
        } => command_create(&schema, &conn),
        Commands::Delete {
            force,
        } => command_delete(&schema, &conn, force),
        Commands::Recreate {
            force,
        } => command_recreate(&schema, &conn, force),
        Commands::Upgrade => command_upgrade(&schema, &conn),
        Commands::RemoveBroker {
            broker_id,
        } => command_remove_broker(&conn, &broker_id),
        Commands::RemoveBridge {
            name,
        } => command_remove_bridge(&conn, &name),
        Commands::DropTables {
            pattern,
        } => command_drop_tables(&schema, &conn, &pattern),
        Commands::ResetLock => command_reset_lock(&conn),
        Commands::Dump => command_dump(&conn),
        Commands::Backup {
            dir,
        } => command_backup(&conn, &dir),
        Commands::Restore {
            dir,
        } => command_restore(&conn, &dir),
        Commands::Query {
            command,
        } => command_query(&conn, &command),
    }
}

// ============================================================================
// SECTION: Table Lock
// ============================================================================

/// Identity recorded as the lock holder for this process.
fn lock_holder() -> String {
    format!("granary-dbmgr:{}", std::process::id())
}

/// Runs a destructive operation under the administrative table lock.
///
/// The lock is released best-effort afterwards; commands that drop the
/// version table (delete, recreate) discard the lock with it.
fn run_locked<T>(
    conn: &Connection,
    op: impl FnOnce(&Connection) -> Result<T, granary_core::StoreFault>,
) -> CliResult<T> {
    let holder = lock_holder();
    version::acquire_lock(conn, &holder)?;
    let result = op(conn);
    let _ = version::release_lock(conn, &holder);
    Ok(result?)
}

// ============================================================================
// SECTION: Schema Commands
// ============================================================================

/// Executes the `create` command.
fn command_create(schema: &SchemaManager, conn: &Connection) -> CliResult<ExitCode> {
    schema.create_tables(conn)?;
    write_stdout_line(&format!(
        "store tables created (version {})",
        granary_store::schema::STORE_VERSION
    ))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `delete` command.
fn command_delete(schema: &SchemaManager, conn: &Connection, force: bool) -> CliResult<ExitCode> {
    if !force {
        return Err(CliError::new(
            "delete drops every store table; pass --force to confirm".to_string(),
        ));
    }
    run_locked(conn, |conn| schema.drop_tables(conn))?;
    write_stdout_line("store tables dropped")?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `recreate` command.
fn command_recreate(schema: &SchemaManager, conn: &Connection, force: bool) -> CliResult<ExitCode> {
    if !force {
        return Err(CliError::new(
            "recreate drops every store table; pass --force to confirm".to_string(),
        ));
    }
    run_locked(conn, |conn| schema.recreate(conn))?;
    write_stdout_line("store tables recreated")?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `upgrade` command.
fn command_upgrade(schema: &SchemaManager, conn: &Connection) -> CliResult<ExitCode> {
    schema.upgrade_store(conn)?;
    write_stdout_line(&format!(
        "store upgraded to version {}; old tables left in place (drop-tables --pattern '%41' \
         once verified)",
        granary_store::schema::STORE_VERSION
    ))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `drop-tables` command.
fn command_drop_tables(
    schema: &SchemaManager,
    conn: &Connection,
    pattern: &str,
) -> CliResult<ExitCode> {
    let dropped = schema.drop_tables_by_pattern(conn, pattern)?;
    if dropped.is_empty() {
        write_stdout_line(&format!("no tables match pattern {pattern}"))?;
    } else {
        for name in &dropped {
            write_stdout_line(&format!("dropped {name}"))?;
        }
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes the `reset-lock` command.
fn command_reset_lock(conn: &Connection) -> CliResult<ExitCode> {
    let previous = version::get_lock(conn)?;
    version::reset_lock(conn)?;
    match previous {
        Some(holder) => write_stdout_line(&format!("table lock held by {holder} cleared"))?,
        None => write_stdout_line("table lock was not held")?,
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Data Commands
// ============================================================================

/// Executes the `remove-broker` command.
fn command_remove_broker(conn: &Connection, broker_id: &str) -> CliResult<ExitCode> {
    let id = BrokerId::new(broker_id);
    run_locked(conn, |conn| {
        if broker::is_being_taken_over(conn, &id)? {
            return Err(granary_core::StoreFault::conflict(format!(
                "broker {id} is being taken over; finish or compensate the takeover first"
            )));
        }
        let sessions = store_session::delete_by_broker(conn, &id)?;
        broker::delete(conn, &id)?;
        Ok(sessions)
    })
    .map(|sessions| {
        let _ = write_stdout_line(&format!(
            "broker {broker_id} removed along with {sessions} store session(s)"
        ));
        ExitCode::SUCCESS
    })
}

/// Executes the `remove-bridge` command.
fn command_remove_bridge(conn: &Connection, name: &str) -> CliResult<ExitCode> {
    let removed = run_locked(conn, |conn| bridge_log::delete_by_name(conn, name))?;
    write_stdout_line(&format!("removed {removed} log record(s) for bridge {name}"))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `dump` command.
fn command_dump(conn: &Connection) -> CliResult<ExitCode> {
    let rows = [
        (dao::MESSAGE_TABLE, message::get_all(conn)?.len()),
        (dao::CONSUMER_STATE_TABLE, consumer_state::get_all(conn)?.len()),
        (dao::TRANSACTION_TABLE, txn::get_all(conn)?.len()),
        (dao::DESTINATION_TABLE, destination::get_all(conn, None)?.len()),
        (dao::CONSUMER_TABLE, consumer::get_all(conn)?.len()),
        (dao::BROKER_TABLE, broker::get_all(conn)?.len()),
        (dao::SESSION_TABLE, store_session::get_all(conn)?.len()),
        (dao::PROPERTY_TABLE, property::get_all(conn)?.len()),
        (dao::CONFIG_RECORD_TABLE, config_record::get_all(conn)?.len()),
        (dao::BRIDGE_LOG_TABLE, bridge_log::get_all(conn)?.len()),
    ];
    for (table, count) in rows {
        write_stdout_line(&format!("{table}: {count} row(s)"))?;
    }
    Ok(ExitCode::SUCCESS)
}

/// Executes the `backup` command.
fn command_backup(conn: &Connection, dir: &PathBuf) -> CliResult<ExitCode> {
    backup::backup_store(conn, dir)?;
    write_stdout_line(&format!("store backed up to {}", dir.display()))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `restore` command.
fn command_restore(conn: &Connection, dir: &PathBuf) -> CliResult<ExitCode> {
    run_locked(conn, |conn| backup::restore_store(conn, dir))?;
    write_stdout_line(&format!("store restored from {}", dir.display()))?;
    Ok(ExitCode::SUCCESS)
}

/// Executes the `query` command.
fn command_query(conn: &Connection, command: &QueryCommand) -> CliResult<ExitCode> {
    match command {
        QueryCommand::Broker {
            broker_id,
        } => {
            let info = broker::get_info(conn, &BrokerId::new(broker_id.as_str()))?;
            write_json(&info)?;
        }
        QueryCommand::Message {
            message_id,
        } => {
            let record = message::get_message(conn, &MessageId::new(message_id.as_str()))?;
            write_json(&record)?;
        }
        QueryCommand::Transaction {
            transaction_id,
        } => {
            let record = txn::get_info(conn, TransactionId::new(*transaction_id))?;
            write_json(&record)?;
        }
        QueryCommand::Destination {
            destination_id,
        } => {
            let record =
                destination::get(conn, &granary_core::DestinationId::new(destination_id.as_str()))?;
            write_json(&record)?;
        }
        QueryCommand::States {
            message_id,
        } => {
            let states =
                consumer_state::get_states(conn, &MessageId::new(message_id.as_str()))?;
            write_json(&states)?;
        }
        QueryCommand::Session {
            session_id,
        } => {
            let owner = store_session::get_owner(conn, SessionId::new(*session_id))?;
            write_stdout_line(&format!("store session {session_id} is owned by {owner}"))?;
        }
        QueryCommand::Version => {
            let stored = version::get_version(conn)?;
            let lock = version::get_lock(conn)?;
            match stored {
                Some(value) => write_stdout_line(&format!("store version: {value}"))?,
                None => write_stdout_line("store version: none recorded")?,
            }
            match lock {
                Some(holder) => write_stdout_line(&format!("table lock: held by {holder}"))?,
                None => write_stdout_line("table lock: free")?,
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// SECTION: Output Helpers
// ============================================================================

/// Writes a single line to stdout.
fn write_stdout_line(message: &str) -> CliResult<()> {
    let mut stdout = std::io::stdout();
    writeln!(&mut stdout, "{message}")
        .map_err(|err| CliError::new(format!("write stdout: {err}")))
}

/// Writes a value as pretty JSON to stdout.
fn write_json<T: serde::Serialize>(value: &T) -> CliResult<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|err| CliError::new(format!("encode output: {err}")))?;
    write_stdout_line(&json)
}

/// Writes a single line to stderr.
fn write_stderr_line(message: &str) -> std::io::Result<()> {
    let mut stderr = std::io::stderr();
    writeln!(&mut stderr, "{message}")
}

/// Emits an error message to stderr and returns a failure exit code.
fn emit_error(message: &str) -> ExitCode {
    let _ = write_stderr_line(message);
    ExitCode::FAILURE
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp/granary.db\"\npool_size = 2\n").unwrap();
        let config = load_config(Some(&path), None).unwrap();
        assert_eq!(config.pool_size, 2);
        assert_eq!(config.path, PathBuf::from("/tmp/granary.db"));
    }

    #[test]
    fn db_flag_overrides_config_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbmgr.toml");
        std::fs::write(&path, "[store]\npath = \"/tmp/granary.db\"\n").unwrap();
        let db = dir.path().join("other.db");
        let config = load_config(Some(&path), Some(&db)).unwrap();
        assert_eq!(config.path, db);
    }

    #[test]
    fn missing_database_is_an_error() {
        assert!(load_config(None, None).is_err());
    }

    #[test]
    fn create_dump_and_lock_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_path(dir.path().join("store.db"));
        let pool = DbPool::open(&config).unwrap();
        let schema = SchemaManager::new(std::sync::Arc::new(StderrLogSink));
        let conn = pool.connection().unwrap();
        assert_eq!(command_create(&schema, &conn).unwrap(), ExitCode::SUCCESS);
        assert_eq!(command_dump(&conn).unwrap(), ExitCode::SUCCESS);
        assert_eq!(command_reset_lock(&conn).unwrap(), ExitCode::SUCCESS);
        assert_eq!(command_delete(&schema, &conn, true).unwrap(), ExitCode::SUCCESS);
        assert!(command_dump(&conn).is_err());
    }
}
