// crates/granary-store/src/pool.rs
// ============================================================================
// Module: Connection Pool
// Description: Mutex-guarded SQLite connection pool with round-robin borrow.
// Purpose: Provide the single shared mutable resource DAOs borrow per call.
// Dependencies: rusqlite, granary-core
// ============================================================================

//! ## Overview
//! DAOs borrow one connection per call, or receive one threaded through by
//! the facade for multi-DAO transactions. Connections are guarded by
//! mutexes and selected round-robin; borrowing blocks until the selected
//! connection frees up. The pool carries the store's closing flag so retry
//! sleeps and borrows can abort promptly during shutdown.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use granary_core::StoreFault;
use rusqlite::Connection;
use rusqlite::OpenFlags;

use crate::config::StoreConfig;

// ============================================================================
// SECTION: Pool
// ============================================================================

/// Mutex-guarded `SQLite` connection pool.
///
/// # Invariants
/// - Every connection has the same pragmas applied.
/// - Once `set_closing` has been called, borrows fail with a closing
///   fault; connections already borrowed drain normally.
pub struct DbPool {
    /// Pooled connections, each serialized by its own mutex.
    connections: Vec<Mutex<Connection>>,
    /// Round-robin cursor for borrow selection.
    cursor: AtomicUsize,
    /// Set when the owning store begins closing.
    closing: AtomicBool,
}

impl DbPool {
    /// Opens the pool and applies pragmas to every connection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the database cannot be opened.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreFault> {
        let mut connections = Vec::with_capacity(config.pool_size);
        for _ in 0 .. config.pool_size {
            connections.push(Mutex::new(open_connection(config)?));
        }
        Ok(Self {
            connections,
            cursor: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        })
    }

    /// Borrows one connection round-robin, blocking until it is free.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the pool is closing or the mutex is
    /// poisoned.
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>, StoreFault> {
        if self.is_closing() {
            return Err(StoreFault::closing("connection pool is closing"));
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.connections.len();
        self.connections[index]
            .lock()
            .map_err(|_| StoreFault::other("connection mutex poisoned"))
    }

    /// Reports whether the owning store is closing.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Marks the pool as closing; subsequent borrows fail fast.
    pub fn set_closing(&self) {
        self.closing.store(true, Ordering::Release);
    }
}

/// Opens one `SQLite` connection with the store's pragmas applied.
fn open_connection(config: &StoreConfig) -> Result<Connection, StoreFault> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let connection = Connection::open_with_flags(&config.path, flags)
        .map_err(|err| StoreFault::other(format!("open database: {err}")))?;
    connection
        .busy_timeout(std::time::Duration::from_millis(config.busy_timeout_ms))
        .map_err(|err| StoreFault::other(format!("busy timeout: {err}")))?;
    connection
        .execute_batch(
            "PRAGMA journal_mode = wal;
             PRAGMA synchronous = full;
             PRAGMA foreign_keys = ON;",
        )
        .map_err(|err| StoreFault::other(format!("apply pragmas: {err}")))?;
    Ok(connection)
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use super::*;

    #[test]
    fn borrow_fails_after_closing() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig::for_path(dir.path().join("pool.db"));
        let pool = DbPool::open(&config).unwrap();
        assert!(pool.connection().is_ok());
        pool.set_closing();
        assert!(pool.connection().is_err());
    }
}
