// crates/granary-store/src/lib.rs
// ============================================================================
// Module: Granary Store
// Description: SQLite-backed persistent message store for the Granary broker.
// Purpose: DAOs, retry strategy, store facade, schema manager, and
//          backup/restore over one shared connection pool.
// Dependencies: granary-core, rusqlite, serde, serde_json, rand, thiserror
// ============================================================================

//! ## Overview
//! The store persists messages, per-consumer delivery state, transactions,
//! destinations, durable consumers, broker membership, store-session
//! ownership, properties, configuration change records, and bridge log
//! records in one `SQLite` database.
//!
//! Layering, bottom up:
//! - [`pool`] — mutex-guarded connection pool with a closing flag.
//! - [`dao`] — one module per logical table; fault classification happens
//!   here, exactly once per driver error.
//! - [`retry`] — bounded retry with doubling backoff and replay-check
//!   propagation.
//! - [`schema`] — table creation, upgrade, and the admin table lock.
//! - [`store`] — the [`SqlStore`] facade the broker talks to, including
//!   the HA takeover state machine and partitioned-store mode.
//! - [`backup`] — JSON-lines backup and restore of every table.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod backup;
pub mod config;
pub mod dao;
pub mod pool;
pub mod retry;
pub mod schema;
pub mod store;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use crate::config::ConfigError;
pub use crate::config::RetryPolicy;
pub use crate::config::StoreConfig;
pub use crate::pool::DbPool;
pub use crate::retry::RetryStrategy;
pub use crate::schema::SchemaManager;
pub use crate::store::MessageCursor;
pub use crate::store::SqlStore;
