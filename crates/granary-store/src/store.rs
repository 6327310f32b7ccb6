// crates/granary-store/src/store.rs
// ============================================================================
// Module: SQL Store Facade
// Description: The store surface the broker core talks to.
// Purpose: Bracket every operation with closed/in-progress accounting,
//          wrap mutations in bounded retry, and run the HA takeover and
//          partitioned-store protocols.
// Dependencies: granary-core, rusqlite, rand, crate::{config,dao,pool,retry,schema}
// ============================================================================

//! ## Overview
//! [`SqlStore`] owns the connection pool and composes the DAO layer into
//! broker-facing operations. Every public method follows the same shape:
//! check the store is open and count the operation in-flight, run the DAO
//! work inside a retry loop (transactional where more than one table is
//! touched), and translate a commit failure into a replay-ambiguous fault
//! so the re-issue runs replay detection.
//!
//! Close is graceful: the closed flag stops new operations, the pool's
//! closing flag aborts retry backoffs, and close blocks until the
//! in-progress count drains to zero.
//!
//! HA takeover is a two-phase protocol. `get_takeover_lock` flips the
//! target broker row with an optimistic CAS and caches a snapshot;
//! `take_over_broker_store` claims the target's destinations, messages,
//! transactions, and sessions in one database transaction and flips the
//! target to its terminal failover state. Any failure after the lock is
//! compensated by restoring the snapshot. In partitioned stores the
//! partition lock serializes takeover against partition arrival so a
//! session is never loaded while its ownership is in flight.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;

use granary_core::BridgeLogRecord;
use granary_core::BrokerId;
use granary_core::BrokerIdentity;
use granary_core::BrokerInfo;
use granary_core::BrokerState;
use granary_core::ConfigChangeRecord;
use granary_core::ConsumerId;
use granary_core::ConsumerRecord;
use granary_core::ConsumerStateRecord;
use granary_core::DeliveryState;
use granary_core::DestinationId;
use granary_core::DestinationRecord;
use granary_core::LogEvent;
use granary_core::LogSink;
use granary_core::MessageId;
use granary_core::MessageRecord;
use granary_core::SessionId;
use granary_core::Severity;
use granary_core::StorageInfo;
use granary_core::StoreFault;
use granary_core::StoreSessionRecord;
use granary_core::TakeoverSnapshot;
use granary_core::TakeoverStoreInfo;
use granary_core::TransactionAck;
use granary_core::TransactionBroker;
use granary_core::TransactionId;
use granary_core::TransactionRecord;
use granary_core::TransactionState;
use granary_core::TransactionUsageInfo;
use rand::Rng;
use rusqlite::Connection;

use crate::config::RetryPolicy;
use crate::config::StoreConfig;
use crate::dao;
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
use crate::pool::DbPool;
use crate::retry;
use crate::schema::SchemaManager;

// ============================================================================
// SECTION: Lifecycle State
// ============================================================================

/// Closed flag and in-progress operation count, guarded together.
struct Lifecycle {
    /// Set once by [`SqlStore::close`]; never cleared.
    closed: bool,
    /// Operations currently inside the facade.
    in_progress: usize,
}

/// RAII in-progress marker; dropping it signals the close drain.
struct OpGuard<'store> {
    /// Owning store.
    store: &'store SqlStore,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut lifecycle) = self.store.lifecycle.lock() {
            lifecycle.in_progress = lifecycle.in_progress.saturating_sub(1);
            if lifecycle.in_progress == 0 {
                self.store.drained.notify_all();
            }
        }
    }
}

// ============================================================================
// SECTION: Store
// ============================================================================

/// SQLite-backed persistent message store.
///
/// # Invariants
/// - After [`close`](Self::close) returns, no operation is in flight and
///   none can start.
/// - `takeover_locks` holds exactly the targets this broker has locked
///   but not yet finished (or compensated).
/// - `partition_stores` holds exactly the sessions materialized locally
///   in partitioned mode.
pub struct SqlStore {
    /// Owning broker identity.
    identity: BrokerIdentity,
    /// Store configuration.
    config: StoreConfig,
    /// Shared connection pool.
    pool: Arc<DbPool>,
    /// Logging sink.
    log: Arc<dyn LogSink>,
    /// This broker's current store session.
    current_session: SessionId,
    /// Closed flag and in-progress count.
    lifecycle: Mutex<Lifecycle>,
    /// Signalled when the in-progress count reaches zero.
    drained: Condvar,
    /// Snapshots of broker rows this broker has takeover-locked; `None`
    /// marks an acquisition still in flight, so the map mutex is never
    /// held across the database CAS and its backoff.
    takeover_locks: Mutex<HashMap<BrokerId, Option<TakeoverSnapshot>>>,
    /// Serializes takeover against partition arrival.
    partition_lock: Mutex<()>,
    /// Sessions materialized locally in partitioned mode.
    partition_stores: Mutex<HashSet<SessionId>>,
}

impl SqlStore {
    /// Opens the store: pool, schema check, broker registration, and the
    /// current store session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on configuration, schema, or registration
    /// failure.
    pub fn open(
        config: StoreConfig,
        identity: BrokerIdentity,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, StoreFault> {
        config
            .validate()
            .map_err(|err| StoreFault::other(format!("invalid store config: {err}")))?;
        let pool = Arc::new(DbPool::open(&config)?);
        let schema = SchemaManager::new(Arc::clone(&log));
        let current_session = {
            let conn = pool.connection()?;
            schema.ensure_tables(&conn, config.create_tables)?;
            register_broker(&conn, &identity)?
        };
        log.log(
            LogEvent::new(Severity::Info, "store.open", "store opened")
                .with("broker", identity.broker_id.to_string())
                .with("session", current_session.to_string()),
        );
        Ok(Self {
            identity,
            config,
            pool,
            log,
            current_session,
            lifecycle: Mutex::new(Lifecycle {
                closed: false,
                in_progress: 0,
            }),
            drained: Condvar::new(),
            takeover_locks: Mutex::new(HashMap::new()),
            partition_lock: Mutex::new(()),
            partition_stores: Mutex::new(HashSet::new()),
        })
    }

    /// Returns this broker's current store session.
    #[must_use]
    pub const fn current_session(&self) -> SessionId {
        self.current_session
    }

    /// Returns the owning broker identity.
    #[must_use]
    pub const fn identity(&self) -> &BrokerIdentity {
        &self.identity
    }

    /// Closes the store, draining in-flight operations.
    ///
    /// New operations fail with a closing fault immediately; retry
    /// backoffs in flight abort at their next closing check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the lifecycle mutex is poisoned.
    pub fn close(&self) -> Result<(), StoreFault> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| StoreFault::other("lifecycle mutex poisoned"))?;
        lifecycle.closed = true;
        self.pool.set_closing();
        while lifecycle.in_progress > 0 {
            lifecycle = self
                .drained
                .wait(lifecycle)
                .map_err(|_| StoreFault::other("lifecycle mutex poisoned"))?;
        }
        self.log.log(LogEvent::new(Severity::Info, "store.close", "store closed"));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Operation bracketing
    // ------------------------------------------------------------------

    /// Checks the store is open and counts an operation in-flight.
    fn begin_op(&self) -> Result<OpGuard<'_>, StoreFault> {
        let mut lifecycle = self
            .lifecycle
            .lock()
            .map_err(|_| StoreFault::other("lifecycle mutex poisoned"))?;
        if lifecycle.closed {
            return Err(StoreFault::closing("store is closed"));
        }
        lifecycle.in_progress += 1;
        Ok(OpGuard {
            store: self,
        })
    }

    /// Runs a read-style operation on one pooled connection, with retry.
    fn with_conn<T>(
        &self,
        policy: RetryPolicy,
        mut op: impl FnMut(&Connection, bool) -> Result<T, StoreFault>,
    ) -> Result<T, StoreFault> {
        let _guard = self.begin_op()?;
        retry::run(&self.pool, &self.log, policy, |replay| {
            let conn = self.pool.connection()?;
            op(&conn, replay)
        })
    }

    /// Runs a multi-statement operation inside a database transaction,
    /// with retry; a commit failure is replay-ambiguous.
    fn with_txn<T>(
        &self,
        policy: RetryPolicy,
        mut op: impl FnMut(&Connection, bool) -> Result<T, StoreFault>,
    ) -> Result<T, StoreFault> {
        let _guard = self.begin_op()?;
        retry::run(&self.pool, &self.log, policy, |replay| {
            let mut conn = self.pool.connection()?;
            let tx = conn
                .transaction()
                .map_err(|err| dao::classify("begin transaction", &err))?;
            let value = op(&tx, replay)?;
            tx.commit().map_err(|err| {
                dao::classify("commit transaction", &err).recoverable().with_replay_check()
            })?;
            Ok(value)
        })
    }

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    /// Persists a message and its initial consumer states atomically.
    ///
    /// Under replay, an already-present message whose stored states
    /// exactly match `states` is a silent success; any partial mismatch
    /// is a hard conflict so corruption never passes silently.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] per the insert diagnosis, replay policy, or
    /// retry exhaustion.
    pub fn store_message(
        &self,
        record: &MessageRecord,
        states: &[(ConsumerId, DeliveryState)],
        check_exists: bool,
    ) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, replay| {
            self.store_message_op(conn, replay, record, states, check_exists)
        })
    }

    /// One attempt of [`Self::store_message`] inside an open transaction.
    fn store_message_op(
        &self,
        conn: &Connection,
        replay: bool,
        record: &MessageRecord,
        states: &[(ConsumerId, DeliveryState)],
        check_exists: bool,
    ) -> Result<(), StoreFault> {
        if replay && message::exists(conn, &record.id)? {
            if consumer_state::states_match(conn, &record.id, states)? {
                return Ok(());
            }
            return Err(StoreFault::conflict(format!(
                "message {} exists with different consumer states after ambiguous write",
                record.id
            )));
        }
        message::insert(conn, &self.identity, record, check_exists)?;
        consumer_state::insert(conn, &record.id, states, record.transaction, record.created_at)
    }

    /// Removes a message and its consumer states atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the message is absent or fenced.
    pub fn remove_message(&self, id: &MessageId) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, replay| {
            consumer_state::delete_by_message(conn, id)?;
            message::delete(conn, &self.identity, id, replay)
        })
    }

    /// Moves a message between destinations, replacing its consumer
    /// states with the target destination's set.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the message is not in `from`.
    pub fn move_message(
        &self,
        id: &MessageId,
        from: &DestinationId,
        to: &DestinationId,
        states: &[(ConsumerId, DeliveryState)],
    ) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, _| {
            message::move_message(conn, id, from, to)?;
            consumer_state::delete_by_message(conn, id)?;
            consumer_state::insert(conn, id, states, None, dao::now_millis())
        })
    }

    /// Loads one message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_message(&self, id: &MessageId) -> Result<MessageRecord, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| message::get_message(conn, id))
    }

    /// Reports whether a message exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn message_exists(&self, id: &MessageId) -> Result<bool, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| message::exists(conn, id))
    }

    /// Counts messages stored for a destination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_message_count(&self, destination: &DestinationId) -> Result<u64, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| message::get_message_count(conn, destination))
    }

    /// Returns count and aggregate bytes for a destination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_storage_info(&self, destination: &DestinationId) -> Result<StorageInfo, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| message::get_storage_info(conn, destination))
    }

    /// Reports whether every consumer has acknowledged the message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn has_message_been_acked(&self, id: &MessageId) -> Result<bool, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| message::has_been_acked(conn, id))
    }

    /// Replaces a corrupted message identifier in place.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the corrupted row is absent.
    pub fn repair_corrupted_message_id(
        &self,
        corrupted: &MessageId,
        replacement: &MessageId,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            message::repair_corrupted_message_id(conn, corrupted, replacement)
        })
    }

    /// Opens a cursor over the messages of one destination and session.
    ///
    /// The cursor counts as an in-progress operation until dropped, so a
    /// graceful close waits for open cursors.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn message_cursor(
        &self,
        destination: &DestinationId,
        session: SessionId,
    ) -> Result<MessageCursor<'_>, StoreFault> {
        let guard = self.begin_op()?;
        let ids = {
            let conn = self.pool.connection()?;
            message::get_message_ids(&conn, destination, session)?
        };
        Ok(MessageCursor {
            store: self,
            _guard: guard,
            ids,
            next: 0,
        })
    }

    // ------------------------------------------------------------------
    // Consumer states
    // ------------------------------------------------------------------

    /// Updates one delivery state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the state row is absent.
    pub fn update_consumer_state(
        &self,
        message_id: &MessageId,
        consumer: ConsumerId,
        state: DeliveryState,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, replay| {
            consumer_state::update_state(conn, message_id, consumer, state, replay)
        })
    }

    /// Updates one delivery state with an expected-state check.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `PreconditionFailed` on a mismatch.
    pub fn update_consumer_state_expected(
        &self,
        message_id: &MessageId,
        consumer: ConsumerId,
        expected: DeliveryState,
        state: DeliveryState,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::update_state_expected(conn, message_id, consumer, expected, state)
        })
    }

    /// Tags an acknowledgement with a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the row is absent or already tagged.
    pub fn update_consumer_transaction(
        &self,
        message_id: &MessageId,
        consumer: ConsumerId,
        transaction: TransactionId,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::update_transaction(conn, message_id, consumer, transaction)
        })
    }

    /// Clears all acknowledgement tags of a transaction (rollback path).
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn clear_consumer_transaction(&self, transaction: TransactionId) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::clear_transaction(conn, transaction)
        })
    }

    /// Loads one delivery state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_consumer_state(
        &self,
        message_id: &MessageId,
        consumer: ConsumerId,
    ) -> Result<DeliveryState, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::get_state(conn, message_id, consumer)
        })
    }

    /// Loads every state row for one message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_consumer_states(
        &self,
        message_id: &MessageId,
    ) -> Result<Vec<ConsumerStateRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| consumer_state::get_states(conn, message_id))
    }

    /// Lists consumers holding state for one message.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_consumer_ids(&self, message_id: &MessageId) -> Result<Vec<ConsumerId>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::get_consumer_ids(conn, message_id)
        })
    }

    /// Lists acknowledgements tagged with one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_transaction_acks(
        &self,
        transaction: TransactionId,
    ) -> Result<Vec<TransactionAck>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            consumer_state::get_transaction_acks(conn, transaction)
        })
    }

    /// Lists every transaction-tagged acknowledgement (recovery path).
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_all_transaction_acks(
        &self,
    ) -> Result<Vec<(TransactionId, TransactionAck)>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| consumer_state::get_all_transaction_acks(conn))
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Persists a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` for a duplicate identifier.
    pub fn store_transaction(&self, record: &TransactionRecord) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, replay| {
            if replay && matches!(txn::get_info(conn, record.id), Ok(existing) if existing == *record)
            {
                return Ok(());
            }
            txn::insert(conn, record)
        })
    }

    /// Updates a transaction's lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent or fenced by the ownership
    /// guard.
    pub fn update_transaction_state(
        &self,
        id: TransactionId,
        state: TransactionState,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, replay| {
            txn::update_state(conn, &self.identity, id, state, replay)
        })
    }

    /// Reassigns the home broker of a remote transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_transaction_home_broker(
        &self,
        id: TransactionId,
        home: &BrokerId,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::update_home_broker(conn, id, home))
    }

    /// Replaces the participant array of a cluster transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_transaction_brokers(
        &self,
        id: TransactionId,
        participants: &[TransactionBroker],
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::update_brokers(conn, id, participants))
    }

    /// Marks one participant complete (CAS on the lifecycle state).
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` on a concurrent change.
    pub fn update_transaction_broker_state(
        &self,
        id: TransactionId,
        expected: TransactionState,
        participant: &BrokerId,
    ) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, _| {
            txn::update_broker_state(conn, id, expected, participant)
        })
    }

    /// Refreshes a transaction's last-accessed timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_transaction_accessed_time(
        &self,
        id: TransactionId,
        accessed_at: i64,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            txn::update_accessed_time(conn, id, accessed_at)
        })
    }

    /// Removes a transaction and its tagged acknowledgements.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent outside replay.
    pub fn remove_transaction(&self, id: TransactionId) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, replay| txn::delete(conn, id, replay))
    }

    /// Loads a transaction's lifecycle state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_transaction_state(&self, id: TransactionId) -> Result<TransactionState, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::get_state(conn, id))
    }

    /// Loads one full transaction record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_transaction_info(&self, id: TransactionId) -> Result<TransactionRecord, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::get_info(conn, id))
    }

    /// Counts messages and acknowledgements tied to a transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_transaction_usage(
        &self,
        id: TransactionId,
    ) -> Result<TransactionUsageInfo, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::get_usage_info(conn, id))
    }

    /// Lists transactions owned by a broker's sessions.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_transactions_by_broker(
        &self,
        broker: &BrokerId,
    ) -> Result<Vec<TransactionId>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::get_by_broker(conn, broker))
    }

    /// Lists remote transactions homed on a broker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_remote_transactions_by_broker(
        &self,
        broker: &BrokerId,
    ) -> Result<Vec<TransactionId>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| txn::get_remote_by_broker(conn, broker))
    }

    // ------------------------------------------------------------------
    // Destinations & consumers
    // ------------------------------------------------------------------

    /// Persists a destination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` for a duplicate identifier.
    pub fn store_destination(&self, record: &DestinationRecord) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, replay| {
            if replay && destination::get(conn, &record.id).is_ok() {
                return Ok(());
            }
            destination::insert(conn, record)
        })
    }

    /// Replaces a destination's descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_destination(
        &self,
        id: &DestinationId,
        descriptor: &serde_json::Value,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            destination::update_descriptor(conn, id, descriptor)
        })
    }

    /// Refreshes the client-attach timestamp of a temporary destination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_destination_connected_time(
        &self,
        id: &DestinationId,
        connected_at: i64,
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            destination::update_connected_time(conn, id, connected_at)
        })
    }

    /// Removes a destination with its messages and their states.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the destination is absent.
    pub fn remove_destination(
        &self,
        id: &DestinationId,
        session: Option<SessionId>,
    ) -> Result<(), StoreFault> {
        self.with_txn(self.config.retry, |conn, _| {
            consumer_state::delete_by_destination_session(conn, id, session)?;
            message::delete_by_destination(conn, id, session)?;
            destination::delete(conn, id)
        })
    }

    /// Loads one destination.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_destination(&self, id: &DestinationId) -> Result<DestinationRecord, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| destination::get(conn, id))
    }

    /// Lists destinations visible to a session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_destinations(
        &self,
        session: Option<SessionId>,
    ) -> Result<Vec<DestinationRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| destination::get_all(conn, session))
    }

    /// Persists a durable consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` for a duplicate identifier.
    pub fn store_consumer(&self, record: &ConsumerRecord) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, replay| {
            if replay && consumer::get(conn, record.id).is_ok() {
                return Ok(());
            }
            consumer::insert(conn, record)
        })
    }

    /// Removes a durable consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn remove_consumer(&self, id: ConsumerId) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| consumer::delete(conn, id))
    }

    /// Lists every durable consumer.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_consumers(&self) -> Result<Vec<ConsumerRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| consumer::get_all(conn))
    }

    // ------------------------------------------------------------------
    // Properties, config records, bridge logs
    // ------------------------------------------------------------------

    /// Stores a property, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn put_property(&self, name: &str, value: &serde_json::Value) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| property::put(conn, name, value))
    }

    /// Loads a property value.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_property(&self, name: &str) -> Result<Option<serde_json::Value>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| property::get(conn, name))
    }

    /// Deletes a property.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn remove_property(&self, name: &str) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| property::delete(conn, name))
    }

    /// Lists every property name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_property_names(&self) -> Result<Vec<String>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| property::get_names(conn))
    }

    /// Appends a configuration change record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn store_config_record(&self, record: &ConfigChangeRecord) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| config_record::insert(conn, record))
    }

    /// Loads configuration records created after `since`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_config_records_since(
        &self,
        since: i64,
    ) -> Result<Vec<ConfigChangeRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| config_record::get_since(conn, since))
    }

    /// Inserts a bridge log record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` for a duplicate branch key.
    pub fn store_bridge_log(&self, record: &BridgeLogRecord) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| bridge_log::insert(conn, record))
    }

    /// Replaces a bridge log payload.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn update_bridge_log(
        &self,
        xid: &str,
        name: &str,
        log_record: &[u8],
    ) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            bridge_log::update(conn, xid, name, log_record, dao::now_millis())
        })
    }

    /// Removes one bridge log record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn remove_bridge_log(&self, xid: &str, name: &str) -> Result<(), StoreFault> {
        self.with_conn(self.config.retry, |conn, _| bridge_log::delete(conn, xid, name))
    }

    /// Loads a bridge service's records written by one broker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_bridge_logs(
        &self,
        name: &str,
        broker: &BrokerId,
    ) -> Result<Vec<BridgeLogRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            bridge_log::get_by_name_broker(conn, name, broker)
        })
    }

    // ------------------------------------------------------------------
    // Broker membership & heartbeat
    // ------------------------------------------------------------------

    /// Refreshes this broker's heartbeat, on the tight heartbeat policy.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the broker row is absent.
    pub fn update_broker_heartbeat(&self) -> Result<(), StoreFault> {
        self.with_conn(RetryPolicy::heartbeat(), |conn, _| {
            broker::update_heartbeat(conn, &self.identity.broker_id, dao::now_millis())
        })
    }

    /// Refreshes another broker's heartbeat only if unchanged since
    /// observation; `false` means the row moved.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the broker row is absent.
    pub fn update_broker_heartbeat_expected(
        &self,
        id: &BrokerId,
        expected: i64,
    ) -> Result<bool, StoreFault> {
        self.with_conn(RetryPolicy::heartbeat(), |conn, _| {
            broker::update_heartbeat_expected(conn, id, expected, dao::now_millis())
        })
    }

    /// Moves this broker's lifecycle state, CAS on the expected state.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `OwnershipLost` when another broker
    /// has locked this row, or `PreconditionFailed` on a state mismatch.
    pub fn update_broker_state(
        &self,
        expected: BrokerState,
        state: BrokerState,
    ) -> Result<(), StoreFault> {
        self.with_conn(RetryPolicy::state_transition(), |conn, _| {
            broker::update_state_this_broker(conn, &self.identity.broker_id, expected, state)
        })
    }

    /// Loads one broker row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when absent.
    pub fn get_broker_info(&self, id: &BrokerId) -> Result<BrokerInfo, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| broker::get_info(conn, id))
    }

    /// Loads every broker row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_all_broker_infos(&self) -> Result<Vec<BrokerInfo>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| broker::get_all(conn))
    }

    /// Lists the store sessions owned by a broker.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn get_store_sessions(
        &self,
        broker: &BrokerId,
    ) -> Result<Vec<StoreSessionRecord>, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| {
            store_session::get_sessions_by_broker(conn, broker)
        })
    }

    /// Loads the owning broker of a store session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the session is absent.
    pub fn get_store_session_owner(&self, session: SessionId) -> Result<BrokerId, StoreFault> {
        self.with_conn(self.config.retry, |conn, _| store_session::get_owner(conn, session))
    }

    // ------------------------------------------------------------------
    // HA takeover
    // ------------------------------------------------------------------

    /// Acquires the takeover lock on a failed broker.
    ///
    /// Locally serialized per target through a reservation in the lock
    /// map; the map mutex is released before the database CAS so
    /// takeovers of distinct targets proceed concurrently. In the
    /// database the lock is one optimistic CAS expecting the observed
    /// state and heartbeat. The pre-lock snapshot is cached for
    /// compensation; a failed CAS removes the reservation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` when this broker already
    /// holds the lock or another broker won the race.
    pub fn get_takeover_lock(
        &self,
        target: &BrokerId,
        expected_state: BrokerState,
        expected_heartbeat: i64,
    ) -> Result<(), StoreFault> {
        let _guard = self.begin_op()?;
        let _partition = self.partition_guard()?;
        {
            let mut locks = self
                .takeover_locks
                .lock()
                .map_err(|_| StoreFault::other("takeover lock map poisoned"))?;
            if locks.contains_key(target) {
                return Err(StoreFault::conflict(format!(
                    "takeover of broker {target} is already in progress here"
                )));
            }
            locks.insert(target.clone(), None);
        }
        let locked = retry::run(&self.pool, &self.log, self.config.retry, |_| {
            let conn = self.pool.connection()?;
            broker::takeover(
                &conn,
                target,
                &self.identity.broker_id,
                expected_state,
                expected_heartbeat,
            )
        });
        let snapshot = match locked {
            Ok(snapshot) => snapshot,
            Err(fault) => {
                self.remove_takeover_lock(target)?;
                return Err(fault);
            }
        };
        self.log.log(
            LogEvent::new(Severity::Info, "takeover.locked", "takeover lock acquired")
                .with("target", target.to_string()),
        );
        let mut locks = self
            .takeover_locks
            .lock()
            .map_err(|_| StoreFault::other("takeover lock map poisoned"))?;
        locks.insert(target.clone(), Some(snapshot));
        Ok(())
    }

    /// Takes over the store of a locked target broker.
    ///
    /// In one database transaction: enumerates the target's local
    /// destinations, messages, transactions, and remote transactions,
    /// reassigns its store sessions, and flips the target row to
    /// `FailoverComplete`. On any failure the snapshot is restored and
    /// the lock entry released.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `PreconditionFailed` when the lock was
    /// never acquired, or the takeover-failed fault after compensation.
    pub fn take_over_broker_store(
        &self,
        target: &BrokerId,
    ) -> Result<TakeoverStoreInfo, StoreFault> {
        let _guard = self.begin_op()?;
        let _partition = self.partition_guard()?;
        let snapshot = {
            let locks = self
                .takeover_locks
                .lock()
                .map_err(|_| StoreFault::other("takeover lock map poisoned"))?;
            locks.get(target).cloned().flatten().ok_or_else(|| {
                StoreFault::precondition(format!("takeover lock on broker {target} is not held"))
            })?
        };
        let result = self.run_takeover(target, &snapshot);
        match result {
            Ok(info) => {
                self.remove_takeover_lock(target)?;
                self.log.log(
                    LogEvent::new(Severity::Info, "takeover.complete", "takeover finished")
                        .with("target", target.to_string())
                        .with("sessions", info.sessions.len().to_string()),
                );
                Ok(info)
            }
            Err(fault) => {
                self.compensate_takeover(target, &snapshot);
                self.remove_takeover_lock(target)?;
                Err(StoreFault::other(format!(
                    "takeover of broker {target} failed and was rolled back: {}",
                    fault.message()
                )))
            }
        }
    }

    /// Claims the target's store inside one database transaction.
    fn run_takeover(
        &self,
        target: &BrokerId,
        snapshot: &TakeoverSnapshot,
    ) -> Result<TakeoverStoreInfo, StoreFault> {
        let mut conn = self.pool.connection()?;
        let tx = conn.transaction().map_err(|err| dao::classify("begin takeover", &err))?;
        let destinations = destination::get_local_by_broker(&tx, target)?;
        let messages = message::get_message_ids_by_broker(&tx, target)?;
        let transactions = txn::get_by_broker(&tx, target)?;
        let remote_transactions = txn::get_remote_by_broker(&tx, target)?;
        let sessions = store_session::takeover_sessions(&tx, target, &self.identity.broker_id)?;
        broker::update_state_other_broker(&tx, target, BrokerState::FailoverComplete)?;
        tx.commit().map_err(|err| dao::classify("commit takeover", &err))?;
        Ok(TakeoverStoreInfo {
            target: target.clone(),
            snapshot: snapshot.clone(),
            destinations,
            messages,
            transactions,
            remote_transactions,
            sessions,
        })
    }

    /// Restores the target row after a failed takeover; best effort.
    fn compensate_takeover(&self, target: &BrokerId, snapshot: &TakeoverSnapshot) {
        let restored = self.pool.connection().and_then(|conn| {
            broker::restore_from_snapshot(&conn, target, &self.identity.broker_id, snapshot)
        });
        match restored {
            Ok(()) => self.log.log(
                LogEvent::new(Severity::Warning, "takeover.compensated", "target row restored")
                    .with("target", target.to_string()),
            ),
            Err(fault) => self.log.log(
                LogEvent::new(
                    Severity::Error,
                    "takeover.compensation_failed",
                    fault.message().to_string(),
                )
                .with("target", target.to_string()),
            ),
        }
    }

    /// Serializes takeover against partition arrival.
    ///
    /// Only partitioned stores materialize sessions concurrently, so the
    /// lock is skipped otherwise.
    fn partition_guard(&self) -> Result<Option<MutexGuard<'_, ()>>, StoreFault> {
        if !self.config.partition_mode {
            return Ok(None);
        }
        self.partition_lock
            .lock()
            .map(Some)
            .map_err(|_| StoreFault::other("partition mutex poisoned"))
    }

    /// Drops the cached lock entry for a target.
    fn remove_takeover_lock(&self, target: &BrokerId) -> Result<(), StoreFault> {
        let mut locks = self
            .takeover_locks
            .lock()
            .map_err(|_| StoreFault::other("takeover lock map poisoned"))?;
        locks.remove(target);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Partitioned mode
    // ------------------------------------------------------------------

    /// Materializes arriving partitions.
    ///
    /// With `Some(session)`, loads that one session after verifying this
    /// broker owns it in the database. With `None` (the monitor path),
    /// try-locks the partition lock — takeover in progress surfaces as a
    /// `Retry` fault — and loads every owned session not yet
    /// materialized. Returns the sessions materialized by this call.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` when partition mode is off
    /// or ownership does not match, or `Retry` when the partition lock
    /// is busy.
    pub fn partition_arrived(
        &self,
        session: Option<SessionId>,
    ) -> Result<Vec<SessionId>, StoreFault> {
        let _guard = self.begin_op()?;
        if !self.config.partition_mode {
            return Err(StoreFault::conflict("store is not in partitioned mode"));
        }
        match session {
            Some(session) => {
                let _partition = self
                    .partition_lock
                    .lock()
                    .map_err(|_| StoreFault::other("partition mutex poisoned"))?;
                self.materialize_session(session)?;
                Ok(vec![session])
            }
            None => {
                let Ok(_partition) = self.partition_lock.try_lock() else {
                    return Err(StoreFault::retry_later(
                        "partition lock is busy; a takeover is in progress",
                    ));
                };
                let owned = self.with_pool_sessions()?;
                let mut loaded = Vec::new();
                let mut stores = self
                    .partition_stores
                    .lock()
                    .map_err(|_| StoreFault::other("partition set poisoned"))?;
                for record in owned {
                    if stores.insert(record.id) {
                        loaded.push(record.id);
                    }
                }
                Ok(loaded)
            }
        }
    }

    /// Verifies database ownership and records one materialized session.
    fn materialize_session(&self, session: SessionId) -> Result<(), StoreFault> {
        let owner = retry::run(&self.pool, &self.log, self.config.retry, |_| {
            let conn = self.pool.connection()?;
            store_session::get_owner(&conn, session)
        })?;
        if owner != self.identity.broker_id {
            return Err(StoreFault::conflict(format!(
                "store session {session} is owned by {owner}, not this broker"
            )));
        }
        let mut stores = self
            .partition_stores
            .lock()
            .map_err(|_| StoreFault::other("partition set poisoned"))?;
        if !stores.insert(session) {
            return Err(StoreFault::conflict(format!(
                "store session {session} is already materialized"
            )));
        }
        Ok(())
    }

    /// Loads this broker's sessions from the database.
    fn with_pool_sessions(&self) -> Result<Vec<StoreSessionRecord>, StoreFault> {
        retry::run(&self.pool, &self.log, self.config.retry, |_| {
            let conn = self.pool.connection()?;
            store_session::get_sessions_by_broker(&conn, &self.identity.broker_id)
        })
    }

    /// Migrates a materialized partition to another broker.
    ///
    /// The session must be materialized locally and the store must allow
    /// migration; the handle is removed before ownership moves so no new
    /// work lands on the departing partition.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] with `Conflict` when migration is disabled,
    /// the session is not materialized, or ownership moved concurrently.
    pub fn partition_departure(
        &self,
        session: SessionId,
        target: &BrokerId,
    ) -> Result<(), StoreFault> {
        let _guard = self.begin_op()?;
        if !self.config.partition_migratable {
            return Err(StoreFault::conflict("partition migration is disabled"));
        }
        {
            let mut stores = self
                .partition_stores
                .lock()
                .map_err(|_| StoreFault::other("partition set poisoned"))?;
            if !stores.remove(&session) {
                return Err(StoreFault::conflict(format!(
                    "store session {session} is not materialized here"
                )));
            }
        }
        retry::run(&self.pool, &self.log, self.config.retry, |_| {
            let conn = self.pool.connection()?;
            store_session::move_session(&conn, session, &self.identity.broker_id, target)
        })?;
        self.log.log(
            LogEvent::new(Severity::Info, "partition.departed", "partition migrated")
                .with("session", session.to_string())
                .with("target", target.to_string()),
        );
        Ok(())
    }

    /// Lists the sessions currently materialized locally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] when the partition set mutex is poisoned.
    pub fn partition_sessions(&self) -> Result<Vec<SessionId>, StoreFault> {
        let stores = self
            .partition_stores
            .lock()
            .map_err(|_| StoreFault::other("partition set poisoned"))?;
        let mut sessions: Vec<SessionId> = stores.iter().copied().collect();
        sessions.sort_unstable();
        Ok(sessions)
    }
}

// ============================================================================
// SECTION: Message Cursor
// ============================================================================

/// Explicitly-droppable cursor over one destination's messages.
///
/// Holds an in-progress marker: a graceful close waits for open cursors,
/// and dropping the cursor releases the marker.
pub struct MessageCursor<'store> {
    /// Owning store.
    store: &'store SqlStore,
    /// In-progress marker held for the cursor's lifetime.
    _guard: OpGuard<'store>,
    /// Identifier snapshot taken at cursor open.
    ids: Vec<MessageId>,
    /// Next index into `ids`.
    next: usize,
}

impl MessageCursor<'_> {
    /// Fetches the next message, `None` at the end.
    ///
    /// A message deleted since the snapshot is skipped.
    ///
    /// # Errors
    ///
    /// Returns [`StoreFault`] on driver failure.
    pub fn next(&mut self) -> Result<Option<MessageRecord>, StoreFault> {
        while self.next < self.ids.len() {
            let id = self.ids[self.next].clone();
            self.next += 1;
            let conn = self.store.pool.connection()?;
            match message::get_message(&conn, &id) {
                Ok(record) => return Ok(Some(record)),
                Err(fault) if fault.kind() == granary_core::FaultKind::NotFound => {}
                Err(fault) => return Err(fault),
            }
        }
        Ok(None)
    }

    /// Number of identifiers remaining in the snapshot.
    #[must_use]
    pub const fn remaining(&self) -> usize {
        self.ids.len().saturating_sub(self.next)
    }
}

// ============================================================================
// SECTION: Registration
// ============================================================================

/// Registers the broker row and ensures a current store session.
fn register_broker(
    conn: &Connection,
    identity: &BrokerIdentity,
) -> Result<SessionId, StoreFault> {
    let existing = broker::get_all(conn)?
        .into_iter()
        .find(|info| info.id == identity.broker_id);
    let info = BrokerInfo {
        id: identity.broker_id.clone(),
        url: existing.as_ref().map_or_else(String::new, |info| info.url.clone()),
        version: existing.as_ref().map_or(1, |info| info.version),
        state: BrokerState::Initializing,
        session: None,
        heartbeat_at: dao::now_millis(),
        takeover_broker: None,
    };
    broker::upsert(conn, &info)?;
    if let Some(session) = store_session::get_current_session(conn, &identity.broker_id)? {
        return Ok(session);
    }
    let session = SessionId::new(new_session_id());
    store_session::insert(
        conn,
        &StoreSessionRecord {
            id: session,
            broker: identity.broker_id.clone(),
            is_current: true,
            created_by: identity.broker_id.to_string(),
            created_at: dao::now_millis(),
        },
    )?;
    Ok(session)
}

/// Mints a fresh store-session identifier.
///
/// Millisecond timestamp in the high bits, random low bits; collisions
/// surface as insert conflicts and the open is retried by the operator.
fn new_session_id() -> u64 {
    let millis = u64::try_from(dao::now_millis()).unwrap_or(0);
    let salt: u64 = rand::thread_rng().gen_range(0 .. (1 << 20));
    (millis << 20) | salt
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, reason = "Test-only assertions are permitted.")]

    use granary_core::MemoryLogSink;

    use super::*;

    fn open_store(dir: &std::path::Path) -> SqlStore {
        let config = StoreConfig::for_path(dir.join("store.db"));
        let identity = BrokerIdentity::standalone("broker-a", "cluster-1");
        SqlStore::open(config, identity, Arc::new(MemoryLogSink::new())).unwrap()
    }

    fn seed_message(store: &SqlStore, id: &str) -> MessageRecord {
        let destination = DestinationRecord {
            id: DestinationId::new("queue-a"),
            descriptor: serde_json::json!({ "kind": "queue" }),
            is_local: false,
            connection_id: None,
            store_session: None,
            created_at: 1_000,
            connected_at: None,
        };
        store.store_destination(&destination).unwrap();
        MessageRecord {
            id: MessageId::new(id),
            destination: destination.id,
            payload: vec![1, 2, 3],
            size: 3,
            store_session: store.current_session(),
            transaction: None,
            created_at: 2_000,
        }
    }

    #[test]
    fn open_registers_broker_and_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let info = store.get_broker_info(&BrokerId::new("broker-a")).unwrap();
        assert_eq!(info.state, BrokerState::Initializing);
        assert_eq!(info.session, Some(store.current_session()));
    }

    #[test]
    fn close_rejects_new_operations() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        store.close().unwrap();
        let err = store.get_consumers().unwrap_err();
        assert_eq!(err.kind(), granary_core::FaultKind::Closing);
    }

    #[test]
    fn reopen_keeps_current_session() {
        let dir = tempfile::tempdir().unwrap();
        let first = open_store(dir.path());
        let session = first.current_session();
        first.close().unwrap();
        let second = open_store(dir.path());
        assert_eq!(second.current_session(), session);
    }

    #[test]
    fn replayed_store_with_matching_states_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let record = seed_message(&store, "MSG-1");
        let states = [(ConsumerId::new(7), DeliveryState::Routed)];
        store.store_message(&record, &states, true).unwrap();
        let conn = store.pool.connection().unwrap();
        store.store_message_op(&conn, true, &record, &states, true).unwrap();
        drop(conn);
        assert_eq!(store.get_consumer_states(&record.id).unwrap().len(), 1);
    }

    #[test]
    fn replayed_store_with_different_states_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path());
        let record = seed_message(&store, "MSG-1");
        store.store_message(&record, &[(ConsumerId::new(7), DeliveryState::Routed)], true).unwrap();
        let conn = store.pool.connection().unwrap();
        let err = store
            .store_message_op(
                &conn,
                true,
                &record,
                &[(ConsumerId::new(8), DeliveryState::Routed)],
                true,
            )
            .unwrap_err();
        assert_eq!(err.kind(), granary_core::FaultKind::Conflict);
    }
}
