// crates/granary-core/src/interfaces/mod.rs
// ============================================================================
// Module: Granary Interfaces
// Description: Injected collaborator seams for store implementations.
// Purpose: Define the logging sink and broker-identity contracts consumed
//          by every store backend.
// Dependencies: crate::core
// ============================================================================

//! ## Overview
//! Store backends never reach for global state: the owning process builds
//! a [`BrokerIdentity`] and a [`LogSink`] at its composition root and
//! passes both into every component at construction time. Implementations
//! must be safe to share across the store's worker threads.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::fmt;
use std::sync::Mutex;

use crate::core::identifiers::BrokerId;

// ============================================================================
// SECTION: Broker Identity
// ============================================================================

/// Identity of the broker process owning a store instance.
///
/// # Invariants
/// - `broker_id` is stable across restarts of the same broker.
/// - `ha_enabled` never changes for the life of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerIdentity {
    /// This broker's cluster-wide identifier.
    pub broker_id: BrokerId,
    /// Cluster identifier shared by all cooperating brokers.
    pub cluster_id: String,
    /// Whether HA failover/takeover is enabled.
    pub ha_enabled: bool,
}

impl BrokerIdentity {
    /// Creates a standalone (non-HA) identity.
    #[must_use]
    pub fn standalone(broker_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            broker_id: BrokerId::new(broker_id),
            cluster_id: cluster_id.into(),
            ha_enabled: false,
        }
    }

    /// Creates an HA-enabled identity.
    #[must_use]
    pub fn ha(broker_id: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            broker_id: BrokerId::new(broker_id),
            cluster_id: cluster_id.into(),
            ha_enabled: true,
        }
    }
}

// ============================================================================
// SECTION: Log Events
// ============================================================================

/// Log severity.
///
/// # Invariants
/// - Variants are stable for programmatic filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Diagnostic detail.
    Debug,
    /// Normal operational event.
    Info,
    /// Degraded but continuing.
    Warning,
    /// Operation failed.
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Structured log event emitted by store components.
///
/// # Invariants
/// - `code` is a stable machine-readable label; `message` is for humans.
/// - Context values must not embed raw payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Event severity.
    pub severity: Severity,
    /// Stable event code, e.g. `store.retry`.
    pub code: &'static str,
    /// Human-readable message.
    pub message: String,
    /// Context key/value pairs (entity IDs, destinations, sessions).
    pub context: Vec<(&'static str, String)>,
}

impl LogEvent {
    /// Creates a new event with no context.
    #[must_use]
    pub fn new(severity: Severity, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            severity,
            code,
            message: message.into(),
            context: Vec::new(),
        }
    }

    /// Appends one context pair.
    #[must_use]
    pub fn with(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.context.push((key, value.into()));
        self
    }
}

/// Logging sink consumed by store components.
///
/// Implementations plug the store into whatever the owning process uses
/// for logging; the store itself never writes to stdout or stderr.
pub trait LogSink: Send + Sync {
    /// Records one event.
    fn log(&self, event: LogEvent);
}

/// In-memory log sink for tests and diagnostics.
///
/// # Invariants
/// - Events are retained in emission order.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    /// Recorded events guarded for cross-thread emission.
    events: Mutex<Vec<LogEvent>>,
}

impl MemoryLogSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded events.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.events.lock().map(|guard| guard.clone()).unwrap_or_default()
    }

    /// Reports whether any event with the given code was recorded.
    #[must_use]
    pub fn has_code(&self, code: &str) -> bool {
        self.snapshot().iter().any(|event| event.code == code)
    }
}

impl LogSink for MemoryLogSink {
    fn log(&self, event: LogEvent) {
        if let Ok(mut guard) = self.events.lock() {
            guard.push(event);
        }
    }
}

// ============================================================================
// SECTION: Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_retains_order_and_codes() {
        let sink = MemoryLogSink::new();
        sink.log(LogEvent::new(Severity::Info, "store.open", "opened"));
        sink.log(
            LogEvent::new(Severity::Warning, "store.retry", "retrying").with("attempt", "1"),
        );
        let events = sink.snapshot();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].code, "store.open");
        assert!(sink.has_code("store.retry"));
        assert!(!sink.has_code("store.close"));
    }
}
