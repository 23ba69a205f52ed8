//! Audit events for degraded-mode decisions.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use super::policy::FailureMode;

/// Something an operator should be able to account for after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditEvent {
    /// The counter store failed and the fallback decided the request
    StoreFallback {
        entity: String,
        endpoint: String,
        mode: FailureMode,
        store: &'static str,
        error: String,
        at: DateTime<Utc>,
    },
    /// A policy reload failed; the previous snapshot stays in effect
    PolicyReloadRejected {
        error: String,
        kept_version: u64,
        at: DateTime<Utc>,
    },
}

/// Receiver of audit events.
pub trait AuditSink: Send + Sync + std::fmt::Debug {
    fn record(&self, event: AuditEvent);
}

/// Writes audit events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        match event {
            AuditEvent::StoreFallback {
                entity,
                endpoint,
                mode,
                store,
                error,
                ..
            } => {
                warn!(
                    audit = "store_fallback",
                    entity = %entity,
                    endpoint = %endpoint,
                    mode = %mode,
                    store = store,
                    error = %error,
                    "Counter store unavailable, fallback applied"
                );
            }
            AuditEvent::PolicyReloadRejected {
                error,
                kept_version,
                ..
            } => {
                warn!(
                    audit = "policy_reload_rejected",
                    error = %error,
                    kept_version = kept_version,
                    "Policy reload failed, keeping previous snapshot"
                );
            }
        }
    }
}

/// Keeps audit events in memory, for embedding applications and tests.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events.lock().push(event);
    }
}
