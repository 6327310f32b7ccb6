// crates/granary-core/src/lib.rs
// ============================================================================
// Module: Granary Core
// Description: Backend-agnostic data model and contracts for the message store.
// Purpose: Define entities, fault taxonomy, and interface seams shared by all
//          store backends and the administrative front end.
// Dependencies: serde, serde_json, thiserror
// ============================================================================

//! ## Overview
//! `granary-core` defines the logical data model of a JMS-style broker's
//! persistent store: messages, per-consumer acknowledgement state,
//! transactions, destinations, durable consumers, broker membership rows,
//! and store sessions. It also defines the immutable fault taxonomy every
//! backend constructs at its driver boundary, and the interface seams
//! (logging sink, broker identity) injected into store implementations.
//!
//! No SQL or driver detail lives here; backends translate driver errors
//! into [`StoreFault`] exactly once and never mutate them afterwards.

// ============================================================================
// SECTION: Modules
// ============================================================================

pub mod core;
pub mod interfaces;

// ============================================================================
// SECTION: Re-exports
// ============================================================================

pub use crate::core::fault::FaultKind;
pub use crate::core::fault::StoreFault;
pub use crate::core::identifiers::BrokerId;
pub use crate::core::identifiers::ConsumerId;
pub use crate::core::identifiers::DestinationId;
pub use crate::core::identifiers::MessageId;
pub use crate::core::identifiers::SessionId;
pub use crate::core::identifiers::TransactionId;
pub use crate::core::records::BridgeLogRecord;
pub use crate::core::records::BrokerInfo;
pub use crate::core::records::ConfigChangeRecord;
pub use crate::core::records::ConsumerRecord;
pub use crate::core::records::ConsumerStateRecord;
pub use crate::core::records::DestinationRecord;
pub use crate::core::records::MessageRecord;
pub use crate::core::records::StorageInfo;
pub use crate::core::records::StoreSessionRecord;
pub use crate::core::records::TakeoverSnapshot;
pub use crate::core::records::TakeoverStoreInfo;
pub use crate::core::records::TransactionAck;
pub use crate::core::records::TransactionBroker;
pub use crate::core::records::TransactionRecord;
pub use crate::core::records::TransactionUsageInfo;
pub use crate::core::state::BrokerState;
pub use crate::core::state::DeliveryState;
pub use crate::core::state::TransactionState;
pub use crate::core::state::TransactionType;
pub use interfaces::BrokerIdentity;
pub use interfaces::LogEvent;
pub use interfaces::LogSink;
pub use interfaces::MemoryLogSink;
pub use interfaces::Severity;
