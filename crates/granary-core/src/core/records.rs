// crates/granary-core/src/core/records.rs
// ============================================================================
// Module: Granary Entity Records
// Description: Plain-data records mirroring the store's logical tables.
// Purpose: Carry rows between the store backends and the broker core.
// Dependencies: serde, serde_json, crate::core
// ============================================================================

//! ## Overview
//! One record type per logical table. Records are owned snapshots; the
//! store never hands out references into live database state. Opaque
//! descriptors (destination and consumer descriptors, property values)
//! are carried as JSON values so a backup written by one backend can be
//! restored by another.

// ============================================================================
// SECTION: Imports
// ============================================================================

use serde::Deserialize;
use serde::Serialize;

use crate::core::identifiers::BrokerId;
use crate::core::identifiers::ConsumerId;
use crate::core::identifiers::DestinationId;
use crate::core::identifiers::MessageId;
use crate::core::identifiers::SessionId;
use crate::core::identifiers::TransactionId;
use crate::core::state::BrokerState;
use crate::core::state::DeliveryState;
use crate::core::state::TransactionState;
use crate::core::state::TransactionType;

// ============================================================================
// SECTION: Message
// ============================================================================

/// Persisted message row.
///
/// # Invariants
/// - `id` is globally unique across all destinations and sessions.
/// - Immutable once stored except `destination` (on move) and the
///   transaction tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Content-addressed system message identifier.
    pub id: MessageId,
    /// Destination the message currently belongs to.
    pub destination: DestinationId,
    /// Opaque packet bytes.
    pub payload: Vec<u8>,
    /// Packet size in bytes as reported by the session layer.
    pub size: u64,
    /// Owning store session.
    pub store_session: SessionId,
    /// Transaction the message was produced under, if any.
    pub transaction: Option<TransactionId>,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
}

/// Count and aggregate byte total for a destination's stored messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Number of stored messages.
    pub count: u64,
    /// Aggregate payload bytes.
    pub bytes: u64,
}

// ============================================================================
// SECTION: Consumer State
// ============================================================================

/// Per-consumer delivery/acknowledgement row for one message.
///
/// # Invariants
/// - `(message, consumer)` is unique.
/// - Always references an existing message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerStateRecord {
    /// Message the state applies to.
    pub message: MessageId,
    /// Consumer the state applies to.
    pub consumer: ConsumerId,
    /// Delivery progress.
    pub state: DeliveryState,
    /// Transaction the acknowledgement is tagged with, if any.
    pub transaction: Option<TransactionId>,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
}

/// Acknowledgement tagged with a transaction, as returned by ack queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAck {
    /// Acknowledged message.
    pub message: MessageId,
    /// Acknowledging consumer.
    pub consumer: ConsumerId,
}

// ============================================================================
// SECTION: Transaction
// ============================================================================

/// Participant broker entry in a cluster transaction.
///
/// # Invariants
/// - `completed` flips to `true` exactly once per participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionBroker {
    /// Participant broker.
    pub broker: BrokerId,
    /// Whether this participant has completed its part.
    pub completed: bool,
}

/// Persisted transaction row.
///
/// # Invariants
/// - `Cluster`/`Remote` transactions carry either `home_broker` or a
///   non-empty `participants` list, never both inconsistently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction identifier.
    pub id: TransactionId,
    /// Transaction scope.
    pub txn_type: TransactionType,
    /// Lifecycle state.
    pub state: TransactionState,
    /// Whether the broker auto-rolls the transaction back on restart.
    pub auto_rollback: bool,
    /// Distributed transaction branch identifier, if any.
    pub xid: Option<String>,
    /// Home broker for remote transactions.
    pub home_broker: Option<BrokerId>,
    /// Participant brokers for cluster transactions.
    pub participants: Vec<TransactionBroker>,
    /// Owning store session.
    pub store_session: SessionId,
    /// Expiration timestamp in unix milliseconds (0 = never).
    pub expires_at: i64,
    /// Last-accessed timestamp in unix milliseconds.
    pub accessed_at: i64,
}

/// Message/acknowledgement usage counts for one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionUsageInfo {
    /// Messages produced under the transaction.
    pub message_count: u64,
    /// Acknowledgements tagged with the transaction.
    pub ack_count: u64,
}

// ============================================================================
// SECTION: Destination & Consumer
// ============================================================================

/// Persisted destination row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    /// Destination identifier.
    pub id: DestinationId,
    /// Opaque destination descriptor.
    pub descriptor: serde_json::Value,
    /// Whether the destination is local to its owning broker.
    pub is_local: bool,
    /// Owning connection for temporary destinations.
    pub connection_id: Option<u64>,
    /// Owning store session for local destinations.
    pub store_session: Option<SessionId>,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
    /// Last client-attach timestamp for temporary destinations, in unix
    /// milliseconds.
    pub connected_at: Option<i64>,
}

/// Persisted durable-consumer row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerRecord {
    /// Consumer identifier.
    pub id: ConsumerId,
    /// Opaque consumer descriptor.
    pub descriptor: serde_json::Value,
    /// Durable subscription name, if durable.
    pub durable_name: Option<String>,
    /// Client identifier the subscription is scoped to.
    pub client_id: Option<String>,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
}

// ============================================================================
// SECTION: Broker & Store Session
// ============================================================================

/// Persisted broker membership row.
///
/// # Invariants
/// - `takeover_broker` is set while (and after) another broker holds the
///   takeover lock on this row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerInfo {
    /// Broker identifier.
    pub id: BrokerId,
    /// Broker service URL.
    pub url: String,
    /// Broker version code.
    pub version: u32,
    /// Lifecycle state, including the takeover sub-machine.
    pub state: BrokerState,
    /// Current store session owned by the broker, if known.
    pub session: Option<SessionId>,
    /// Last heartbeat timestamp in unix milliseconds.
    pub heartbeat_at: i64,
    /// Broker currently taking this one over, if any.
    pub takeover_broker: Option<BrokerId>,
}

/// Persisted store-session ownership row.
///
/// # Invariants
/// - Exactly one session per broker is current in non-partitioned mode;
///   partitioned brokers own several concurrent sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSessionRecord {
    /// Session identifier.
    pub id: SessionId,
    /// Owning broker.
    pub broker: BrokerId,
    /// Whether this is the broker's current (active) session.
    pub is_current: bool,
    /// Identity of the creator recorded at session creation.
    pub created_by: String,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
}

// ============================================================================
// SECTION: Auxiliary Records
// ============================================================================

/// Append-only cluster configuration change record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChangeRecord {
    /// Record timestamp in unix milliseconds; defines the journal order.
    pub created_at: i64,
    /// Opaque record bytes.
    pub record: Vec<u8>,
}

/// JMS-bridge transaction-manager log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeLogRecord {
    /// Global transaction branch key.
    pub xid: String,
    /// Opaque log record bytes.
    pub log: Vec<u8>,
    /// Bridge service name.
    pub name: String,
    /// Broker that wrote the record.
    pub broker: BrokerId,
    /// Creation timestamp in unix milliseconds.
    pub created_at: i64,
    /// Last-update timestamp in unix milliseconds.
    pub updated_at: i64,
}

// ============================================================================
// SECTION: Takeover Records
// ============================================================================

/// Snapshot of a target broker row taken when the takeover lock is
/// acquired.
///
/// The snapshot is what makes takeover compensable: a failed takeover
/// restores the target's original state and heartbeat from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TakeoverSnapshot {
    /// Target broker row as it was before the lock flip.
    pub saved: BrokerInfo,
    /// Timestamp at which the lock was acquired, in unix milliseconds.
    pub locked_at: i64,
}

/// Everything a new owner learns while taking over a target's store.
#[derive(Debug, Clone, PartialEq)]
pub struct TakeoverStoreInfo {
    /// Broker whose store was taken over.
    pub target: BrokerId,
    /// Snapshot of the target row from lock acquisition.
    pub snapshot: TakeoverSnapshot,
    /// Local destinations claimed from the target.
    pub destinations: Vec<DestinationRecord>,
    /// Claimed message IDs mapped to their destination.
    pub messages: Vec<(MessageId, DestinationId)>,
    /// Transactions claimed from the target.
    pub transactions: Vec<TransactionId>,
    /// Remote transactions claimed from the target.
    pub remote_transactions: Vec<TransactionId>,
    /// Store sessions reassigned to the new owner.
    pub sessions: Vec<SessionId>,
}
