// crates/granary-store/tests/sql_store_unit.rs
// ============================================================================
// Module: SQL Store Integration Tests
// Description: End-to-end tests for the store facade over a real database.
// Purpose: Validate message lifecycle, CAS semantics, transaction cascades,
//          HA takeover with compensation, partitioned mode, schema upgrade,
//          backup/restore, and graceful close.
// Dependencies: granary-core, granary-store, rusqlite, serde_json, tempfile
// ============================================================================

//! ## Overview
//! Integration-level tests exercising [`granary_store::SqlStore`] and the
//! administrative paths against real `SQLite` files:
//! - Message and consumer-state lifecycle, replay-sensitive inserts
//! - Expected-state (CAS) delivery updates
//! - Transaction removal cascading to tagged acknowledgements
//! - Takeover lock mutual exclusion and session reassignment
//! - Partition arrival/departure fencing
//! - Old-generation upgrade and JSON-lines backup round trip
//! - Close draining open cursors

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only assertions and helpers are permitted."
)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use granary_core::BrokerId;
use granary_core::BrokerIdentity;
use granary_core::BrokerInfo;
use granary_core::BrokerState;
use granary_core::ConsumerId;
use granary_core::DeliveryState;
use granary_core::DestinationId;
use granary_core::DestinationRecord;
use granary_core::FaultKind;
use granary_core::MemoryLogSink;
use granary_core::MessageId;
use granary_core::MessageRecord;
use granary_core::SessionId;
use granary_core::StoreSessionRecord;
use granary_core::TransactionId;
use granary_core::TransactionRecord;
use granary_core::TransactionState;
use granary_core::TransactionType;
use granary_store::DbPool;
use granary_store::SchemaManager;
use granary_store::SqlStore;
use granary_store::StoreConfig;
use granary_store::backup;
use granary_store::dao::broker;
use granary_store::dao::destination;
use granary_store::dao::message;
use granary_store::dao::property;
use granary_store::dao::store_session;
use granary_store::dao::version;
use rusqlite::params;
use tempfile::TempDir;

// ============================================================================
// SECTION: Helpers
// ============================================================================

fn fast_config(path: &Path) -> StoreConfig {
    let mut config = StoreConfig::for_path(path);
    config.retry = granary_store::RetryPolicy {
        max_attempts: 2,
        initial_delay_ms: 1,
    };
    config
}

fn open_ha_store(dir: &TempDir) -> SqlStore {
    let config = fast_config(&dir.path().join("store.db"));
    let identity = BrokerIdentity::ha("broker-a", "cluster-1");
    SqlStore::open(config, identity, Arc::new(MemoryLogSink::new())).unwrap()
}

fn open_partition_store(dir: &TempDir, migratable: bool) -> SqlStore {
    let mut config = fast_config(&dir.path().join("store.db"));
    config.partition_mode = true;
    config.partition_migratable = migratable;
    let identity = BrokerIdentity::ha("broker-a", "cluster-1");
    SqlStore::open(config, identity, Arc::new(MemoryLogSink::new())).unwrap()
}

fn raw_pool(dir: &TempDir) -> DbPool {
    DbPool::open(&fast_config(&dir.path().join("store.db"))).unwrap()
}

fn sample_destination(id: &str, session: SessionId) -> DestinationRecord {
    DestinationRecord {
        id: DestinationId::new(id),
        descriptor: serde_json::json!({ "kind": "queue", "name": id }),
        is_local: true,
        connection_id: None,
        store_session: Some(session),
        created_at: 1_000,
        connected_at: None,
    }
}

fn sample_message(id: &str, destination: &str, session: SessionId) -> MessageRecord {
    MessageRecord {
        id: MessageId::new(id),
        destination: DestinationId::new(destination),
        payload: vec![0xAB, 0xCD, 0xEF],
        size: 3,
        store_session: session,
        transaction: None,
        created_at: 1_000,
    }
}

fn sample_transaction(raw: u64, session: SessionId) -> TransactionRecord {
    TransactionRecord {
        id: TransactionId::new(raw),
        txn_type: TransactionType::Local,
        state: TransactionState::Started,
        auto_rollback: false,
        xid: None,
        home_broker: None,
        participants: Vec::new(),
        store_session: session,
        expires_at: 0,
        accessed_at: 1_000,
    }
}

/// Seeds a second broker with one current session, a destination, and one
/// message, all through the DAO layer.
fn seed_target_broker(dir: &TempDir, broker_id: &str, session_raw: u64) {
    let pool = raw_pool(dir);
    let conn = pool.connection().unwrap();
    broker::insert(
        &conn,
        &BrokerInfo {
            id: BrokerId::new(broker_id),
            url: String::new(),
            version: 1,
            state: BrokerState::Operating,
            session: None,
            heartbeat_at: 500,
            takeover_broker: None,
        },
    )
    .unwrap();
    store_session::insert(
        &conn,
        &StoreSessionRecord {
            id: SessionId::new(session_raw),
            broker: BrokerId::new(broker_id),
            is_current: true,
            created_by: broker_id.to_string(),
            created_at: 500,
        },
    )
    .unwrap();
    let session = SessionId::new(session_raw);
    destination::insert(&conn, &sample_destination("queue-b", session)).unwrap();
    let identity = BrokerIdentity::ha(broker_id, "cluster-1");
    message::insert(&conn, &identity, &sample_message("MSG-B-1", "queue-b", session), false)
        .unwrap();
}

const CONSUMER: ConsumerId = ConsumerId::new(7);

// ============================================================================
// SECTION: Message Lifecycle
// ============================================================================

#[test]
fn message_lifecycle_store_ack_remove() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Delivered)], true).unwrap();

    assert!(store.message_exists(&record.id).unwrap());
    assert_eq!(store.get_message(&record.id).unwrap(), record);
    let info = store.get_storage_info(&record.destination).unwrap();
    assert_eq!(info.count, 1);
    assert_eq!(info.bytes, 3);
    assert!(!store.has_message_been_acked(&record.id).unwrap());

    store.update_consumer_state(&record.id, CONSUMER, DeliveryState::Acknowledged).unwrap();
    assert!(store.has_message_been_acked(&record.id).unwrap());

    store.remove_message(&record.id).unwrap();
    assert!(!store.message_exists(&record.id).unwrap());
    let err = store.remove_message(&record.id).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn duplicate_insert_conflicts_and_missing_destination_is_diagnosed() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[], true).unwrap();

    let err = store.store_message(&record, &[], true).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);

    let orphan = sample_message("MSG-2", "no-such-queue", session);
    let err = store.store_message(&orphan, &[], true).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn replayed_message_delete_is_a_no_op_when_the_row_is_gone() {
    let dir = tempfile::tempdir().unwrap();
    let _store = open_ha_store(&dir);
    let pool = raw_pool(&dir);
    let conn = pool.connection().unwrap();
    let identity = BrokerIdentity::ha("broker-a", "cluster-1");
    let missing = MessageId::new("MSG-GONE");

    // The prior ambiguous attempt already applied; re-issue succeeds.
    message::delete(&conn, &identity, &missing, true).unwrap();

    let err = message::delete(&conn, &identity, &missing, false).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn connected_time_tracks_the_latest_client_attach() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    let id = DestinationId::new("temp-queue");
    store.store_destination(&sample_destination("temp-queue", session)).unwrap();
    assert_eq!(store.get_destination(&id).unwrap().connected_at, None);

    store.update_destination_connected_time(&id, 2_500).unwrap();
    assert_eq!(store.get_destination(&id).unwrap().connected_at, Some(2_500));

    let err = store
        .update_destination_connected_time(&DestinationId::new("no-such-queue"), 2_500)
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn move_message_replaces_consumer_states() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    store.store_destination(&sample_destination("queue-b", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Delivered)], true).unwrap();

    let other = ConsumerId::new(8);
    store
        .move_message(
            &record.id,
            &record.destination,
            &DestinationId::new("queue-b"),
            &[(other, DeliveryState::Routed)],
        )
        .unwrap();

    let moved = store.get_message(&record.id).unwrap();
    assert_eq!(moved.destination, DestinationId::new("queue-b"));
    assert_eq!(store.get_consumer_ids(&record.id).unwrap(), vec![other]);
}

#[test]
fn cursor_iterates_destination_messages() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    for index in 0 .. 3 {
        let mut record = sample_message(&format!("MSG-{index}"), "queue-a", session);
        record.created_at = 1_000 + index;
        store.store_message(&record, &[], true).unwrap();
    }

    let mut cursor = store.message_cursor(&DestinationId::new("queue-a"), session).unwrap();
    assert_eq!(cursor.remaining(), 3);
    let mut seen = Vec::new();
    while let Some(record) = cursor.next().unwrap() {
        seen.push(record.id);
    }
    assert_eq!(seen.len(), 3);
    assert_eq!(seen[0], MessageId::new("MSG-0"));
}

// ============================================================================
// SECTION: Consumer State CAS
// ============================================================================

#[test]
fn expected_state_mismatch_is_a_precondition_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Routed)], true).unwrap();

    let err = store
        .update_consumer_state_expected(
            &record.id,
            CONSUMER,
            DeliveryState::Delivered,
            DeliveryState::Acknowledged,
        )
        .unwrap_err();
    assert_eq!(err.kind(), FaultKind::PreconditionFailed);

    store
        .update_consumer_state_expected(
            &record.id,
            CONSUMER,
            DeliveryState::Routed,
            DeliveryState::Delivered,
        )
        .unwrap();
    assert_eq!(store.get_consumer_state(&record.id, CONSUMER).unwrap(), DeliveryState::Delivered);
}

// ============================================================================
// SECTION: Transactions
// ============================================================================

#[test]
fn removing_a_transaction_cascades_to_tagged_acks() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Delivered)], true).unwrap();

    let txn = sample_transaction(42, session);
    store.store_transaction(&txn).unwrap();
    store.update_consumer_transaction(&record.id, CONSUMER, txn.id).unwrap();
    assert_eq!(store.get_transaction_acks(txn.id).unwrap().len(), 1);

    // Tagging an already-tagged acknowledgement is refused.
    let err = store.update_consumer_transaction(&record.id, CONSUMER, txn.id).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);

    store.update_transaction_state(txn.id, TransactionState::Committed).unwrap();
    assert_eq!(store.get_transaction_state(txn.id).unwrap(), TransactionState::Committed);

    store.remove_transaction(txn.id).unwrap();
    assert!(store.get_transaction_acks(txn.id).unwrap().is_empty());
    assert!(store.get_consumer_states(&record.id).unwrap().is_empty());
    let err = store.get_transaction_state(txn.id).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn delivery_cycle_routes_acknowledges_commits_and_removes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Routed)], true).unwrap();

    store
        .update_consumer_state_expected(
            &record.id,
            CONSUMER,
            DeliveryState::Routed,
            DeliveryState::Delivered,
        )
        .unwrap();

    let txn = sample_transaction(77, session);
    store.store_transaction(&txn).unwrap();
    store.update_consumer_state(&record.id, CONSUMER, DeliveryState::Acknowledged).unwrap();
    store.update_consumer_transaction(&record.id, CONSUMER, txn.id).unwrap();
    assert!(store.has_message_been_acked(&record.id).unwrap());

    store.update_transaction_state(txn.id, TransactionState::Committed).unwrap();
    store.remove_transaction(txn.id).unwrap();
    assert!(store.get_consumer_states(&record.id).unwrap().is_empty());

    store.remove_message(&record.id).unwrap();
    let err = store.get_message(&record.id).unwrap_err();
    assert_eq!(err.kind(), FaultKind::NotFound);
}

#[test]
fn rollback_clears_acknowledgement_tags_without_deleting_states() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Delivered)], true).unwrap();

    let txn = sample_transaction(42, session);
    store.store_transaction(&txn).unwrap();
    store.update_consumer_transaction(&record.id, CONSUMER, txn.id).unwrap();
    store.clear_consumer_transaction(txn.id).unwrap();

    assert!(store.get_transaction_acks(txn.id).unwrap().is_empty());
    assert_eq!(store.get_consumer_states(&record.id).unwrap().len(), 1);
}

// ============================================================================
// SECTION: HA Takeover
// ============================================================================

#[test]
fn takeover_claims_sessions_and_flips_target_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let target = BrokerId::new("broker-b");

    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();

    // A second local acquisition is refused while the first is pending.
    let err = store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);

    let info = store.take_over_broker_store(&target).unwrap();
    assert_eq!(info.sessions, vec![SessionId::new(9_001)]);
    assert_eq!(info.destinations.len(), 1);
    assert_eq!(info.messages.len(), 1);
    assert_eq!(info.messages[0].0, MessageId::new("MSG-B-1"));

    let target_info = store.get_broker_info(&target).unwrap();
    assert_eq!(target_info.state, BrokerState::FailoverComplete);
    assert_eq!(target_info.takeover_broker, Some(BrokerId::new("broker-a")));

    assert_eq!(
        store.get_store_session_owner(SessionId::new(9_001)).unwrap(),
        BrokerId::new("broker-a")
    );
}

#[test]
fn takeover_lock_is_an_optimistic_cas() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let target = BrokerId::new("broker-b");
    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();

    // A racing broker sees the moved row and loses the CAS.
    let pool = raw_pool(&dir);
    let conn = pool.connection().unwrap();
    let err =
        broker::takeover(&conn, &target, &BrokerId::new("broker-c"), BrokerState::Operating, 500)
            .unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);
}

#[test]
fn takeover_without_lock_is_a_precondition_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let err = store.take_over_broker_store(&BrokerId::new("broker-b")).unwrap_err();
    assert_eq!(err.kind(), FaultKind::PreconditionFailed);
}

#[test]
fn failed_takeover_restores_the_target_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let target = BrokerId::new("broker-b");
    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();

    // Compensate a simulated mid-takeover failure: the snapshot restore
    // must revert state, heartbeat, and the takeover marker while the
    // lock holder still owns the row.
    let pool = raw_pool(&dir);
    let conn = pool.connection().unwrap();
    let snapshot = broker::get_info(&conn, &target).unwrap();
    assert_eq!(snapshot.state, BrokerState::FailoverStarted);

    broker::restore_from_snapshot(
        &conn,
        &target,
        &BrokerId::new("broker-a"),
        &granary_core::TakeoverSnapshot {
            saved: BrokerInfo {
                id: target.clone(),
                url: String::new(),
                version: 1,
                state: BrokerState::Operating,
                session: None,
                heartbeat_at: 500,
                takeover_broker: None,
            },
            locked_at: 600,
        },
    )
    .unwrap();
    let restored = broker::get_info(&conn, &target).unwrap();
    assert_eq!(restored.state, BrokerState::Operating);
    assert_eq!(restored.takeover_broker, None);
    assert_eq!(restored.heartbeat_at, 500);
}

#[test]
fn failed_takeover_compensates_and_releases_the_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let target = BrokerId::new("broker-b");
    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();

    // Detach the transaction table so the claim transaction fails and
    // rolls back mid-takeover.
    {
        let pool = raw_pool(&dir);
        let conn = pool.connection().unwrap();
        conn.execute_batch("ALTER TABLE mqtxn50 RENAME TO mqtxn50_detached").unwrap();
    }
    let err = store.take_over_broker_store(&target).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Other);

    {
        let pool = raw_pool(&dir);
        let conn = pool.connection().unwrap();
        conn.execute_batch("ALTER TABLE mqtxn50_detached RENAME TO mqtxn50").unwrap();
        let restored = broker::get_info(&conn, &target).unwrap();
        assert_eq!(restored.state, BrokerState::Operating);
        assert_eq!(restored.takeover_broker, None);
        assert_eq!(restored.heartbeat_at, 500);
        assert_eq!(store_session::get_owner(&conn, SessionId::new(9_001)).unwrap(), target);
    }

    // The released lock permits a fresh attempt, which now succeeds.
    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();
    let info = store.take_over_broker_store(&target).unwrap();
    assert_eq!(info.sessions, vec![SessionId::new(9_001)]);
    assert_eq!(
        store.get_store_session_owner(SessionId::new(9_001)).unwrap(),
        BrokerId::new("broker-a")
    );
}

#[test]
fn lost_takeover_cas_leaves_no_local_reservation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    seed_target_broker(&dir, "broker-b", 9_001);
    let target = BrokerId::new("broker-b");

    // A stale heartbeat loses the database CAS.
    let err = store.get_takeover_lock(&target, BrokerState::Operating, 999).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);

    // The failed acquisition left nothing behind locally.
    store.get_takeover_lock(&target, BrokerState::Operating, 500).unwrap();
    store.take_over_broker_store(&target).unwrap();
}

#[test]
fn message_insert_is_fenced_while_the_owner_is_under_failover() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let owner = BrokerId::new("broker-a");
    let pool = raw_pool(&dir);
    for state in [BrokerState::FailoverPending, BrokerState::FailoverStarted] {
        {
            let conn = pool.connection().unwrap();
            broker::update_state_other_broker(&conn, &owner, state).unwrap();
        }
        let err = store
            .store_message(&sample_message("MSG-1", "queue-a", session), &[], true)
            .unwrap_err();
        assert_eq!(err.kind(), FaultKind::OwnershipLost);
    }
}

// ============================================================================
// SECTION: Partitioned Mode
// ============================================================================

#[test]
fn partition_monitor_loads_owned_sessions_once() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_partition_store(&dir, false);
    let current = store.current_session();

    let loaded = store.partition_arrived(None).unwrap();
    assert_eq!(loaded, vec![current]);
    assert!(store.partition_arrived(None).unwrap().is_empty());

    let err = store.partition_arrived(Some(current)).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);
}

#[test]
fn partition_arrival_verifies_database_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_partition_store(&dir, false);
    seed_target_broker(&dir, "broker-b", 9_001);

    let err = store.partition_arrived(Some(SessionId::new(9_001))).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);
}

#[test]
fn partition_departure_moves_ownership() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_partition_store(&dir, true);
    seed_target_broker(&dir, "broker-b", 9_001);
    let current = store.current_session();
    store.partition_arrived(None).unwrap();

    store.partition_departure(current, &BrokerId::new("broker-b")).unwrap();
    assert!(store.partition_sessions().unwrap().is_empty());
    assert_eq!(
        store.get_store_session_owner(current).unwrap(),
        BrokerId::new("broker-b")
    );

    // A departed session cannot depart twice.
    let err = store.partition_departure(current, &BrokerId::new("broker-b")).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);
}

#[test]
fn partition_departure_requires_migration_enabled() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_partition_store(&dir, false);
    let current = store.current_session();
    store.partition_arrived(None).unwrap();

    let err = store.partition_departure(current, &BrokerId::new("broker-b")).unwrap_err();
    assert_eq!(err.kind(), FaultKind::Conflict);
}

// ============================================================================
// SECTION: Schema Upgrade
// ============================================================================

#[test]
fn upgrade_copies_old_generation_rows() {
    let dir = tempfile::tempdir().unwrap();
    let pool = raw_pool(&dir);
    let conn = pool.connection().unwrap();
    conn.execute_batch(
        "CREATE TABLE mqversion41 (store_version INTEGER NOT NULL, lock_id TEXT);
         CREATE TABLE mqprop41 (name TEXT PRIMARY KEY, value BLOB NOT NULL);",
    )
    .unwrap();
    conn.execute("INSERT INTO mqversion41 (store_version, lock_id) VALUES (41, NULL)", [])
        .unwrap();
    let encoded = serde_json::to_vec(&serde_json::json!("hello")).unwrap();
    conn.execute("INSERT INTO mqprop41 (name, value) VALUES (?1, ?2)", params!["greeting", encoded])
        .unwrap();

    let schema = SchemaManager::new(Arc::new(MemoryLogSink::new()));
    schema.upgrade_store(&conn).unwrap();

    assert_eq!(version::get_version(&conn).unwrap(), Some(granary_store::schema::STORE_VERSION));
    assert_eq!(property::get(&conn, "greeting").unwrap(), Some(serde_json::json!("hello")));
    // Old tables stay for operator verification.
    let old: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = 'mqprop41'",
            [],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(old, 1);
}

// ============================================================================
// SECTION: Backup & Restore
// ============================================================================

#[test]
fn backup_round_trips_into_a_fresh_database() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    let record = sample_message("MSG-1", "queue-a", session);
    store.store_message(&record, &[(CONSUMER, DeliveryState::Delivered)], true).unwrap();
    store.put_property("greeting", &serde_json::json!("hello")).unwrap();

    let backup_dir = dir.path().join("backup");
    {
        let pool = raw_pool(&dir);
        let conn = pool.connection().unwrap();
        backup::backup_store(&conn, &backup_dir).unwrap();
    }

    let restored_config = fast_config(&dir.path().join("restored.db"));
    let pool = DbPool::open(&restored_config).unwrap();
    let conn = pool.connection().unwrap();
    let schema = SchemaManager::new(Arc::new(MemoryLogSink::new()));
    schema.create_tables(&conn).unwrap();
    backup::restore_store(&conn, &backup_dir).unwrap();

    assert_eq!(message::get_message(&conn, &record.id).unwrap(), record);
    assert_eq!(property::get(&conn, "greeting").unwrap(), Some(serde_json::json!("hello")));
    assert_eq!(
        store_session::get_owner(&conn, session).unwrap(),
        BrokerId::new("broker-a")
    );
}

// ============================================================================
// SECTION: Close Semantics
// ============================================================================

#[test]
fn close_waits_for_open_cursors() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_ha_store(&dir);
    let session = store.current_session();
    store.store_destination(&sample_destination("queue-a", session)).unwrap();
    store.store_message(&sample_message("MSG-1", "queue-a", session), &[], true).unwrap();

    let closed = AtomicBool::new(false);
    thread::scope(|scope| {
        let cursor = store.message_cursor(&DestinationId::new("queue-a"), session).unwrap();
        let handle = scope.spawn(|| {
            store.close().unwrap();
            closed.store(true, Ordering::SeqCst);
        });
        thread::sleep(Duration::from_millis(150));
        assert!(!closed.load(Ordering::SeqCst));
        drop(cursor);
        handle.join().unwrap();
    });
    assert!(closed.load(Ordering::SeqCst));

    let err = store.get_consumers().unwrap_err();
    assert_eq!(err.kind(), FaultKind::Closing);
}
