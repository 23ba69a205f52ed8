//! Versioned policy snapshots.
//!
//! The resolver never reads the policy store directly. It reads an
//! immutable [`PolicySnapshot`] that a [`PolicyCache`] swaps out when the
//! snapshot is older than the cache TTL or after an explicit invalidation.
//! Readers holding an old `Arc` keep a consistent view until they finish.

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::audit::{AuditEvent, AuditSink, TracingAuditSink};
use super::policy::{EntityType, Policy};
use super::policy_store::PolicyStore;
use super::request::AdmissionRequest;
use super::resolver::most_specific;
use crate::error::{Result, TollgateError};

/// An immutable, validated set of active policies.
#[derive(Debug, Default)]
pub struct PolicySnapshot {
    version: u64,
    by_entity: HashMap<EntityType, Vec<Policy>>,
}

impl PolicySnapshot {
    /// Build a snapshot, dropping inactive policies.
    pub fn new(version: u64, policies: Vec<Policy>) -> Self {
        let mut by_entity: HashMap<EntityType, Vec<Policy>> = HashMap::new();
        for policy in policies.into_iter().filter(|p| p.is_active) {
            by_entity.entry(policy.entity_type).or_default().push(policy);
        }
        Self { version, by_entity }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Number of active policies.
    pub fn len(&self) -> usize {
        self.by_entity.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Active policies for one entity type.
    pub fn policies_for(&self, entity_type: EntityType) -> &[Policy] {
        self.by_entity
            .get(&entity_type)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The policy governing `request`, if any.
    pub fn find(&self, request: &AdmissionRequest) -> Option<&Policy> {
        most_specific(self.policies_for(request.entity_type), request)
    }
}

/// Default bound on a single policy reload.
pub const DEFAULT_RELOAD_TIMEOUT: Duration = Duration::from_secs(1);

/// Holds the current snapshot and reloads it from a [`PolicyStore`].
///
/// Readers never wait on the policy store once a snapshot has been
/// installed: a stale read returns the installed snapshot and hands the
/// reload to a background task. Only the very first load is awaited, and
/// it is bounded by the reload timeout.
#[derive(Debug)]
pub struct PolicyCache {
    store: Arc<dyn PolicyStore>,
    ttl: Duration,
    reload_timeout: Duration,
    current: RwLock<Arc<PolicySnapshot>>,
    checked_at: Mutex<Option<Instant>>,
    invalidated: AtomicBool,
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
    audit: Arc<dyn AuditSink>,
}

impl PolicyCache {
    /// Create a cache holding an empty snapshot (version 0). The first read
    /// loads from the store.
    pub fn new(store: Arc<dyn PolicyStore>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            reload_timeout: DEFAULT_RELOAD_TIMEOUT,
            current: RwLock::new(Arc::new(PolicySnapshot::default())),
            checked_at: Mutex::new(None),
            invalidated: AtomicBool::new(false),
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Route reload failures to a specific audit sink.
    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Give up on a policy load after `timeout`.
    pub fn with_reload_timeout(mut self, timeout: Duration) -> Self {
        self.reload_timeout = timeout;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn reload_timeout(&self) -> Duration {
        self.reload_timeout
    }

    /// The snapshot currently installed, without checking freshness.
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current.read().clone()
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    fn is_fresh(&self) -> bool {
        if self.invalidated.load(Ordering::Acquire) {
            return false;
        }
        match *self.checked_at.lock() {
            Some(checked) => checked.elapsed() < self.ttl,
            None => false,
        }
    }

    fn ever_loaded(&self) -> bool {
        self.checked_at.lock().is_some()
    }

    /// The snapshot to decide with.
    ///
    /// A stale snapshot is still returned; at most one task reloads it in the
    /// background. If that reload fails the previous snapshot stays in effect
    /// for another TTL period; a failed reload never clears policies.
    pub async fn snapshot(self: &Arc<Self>) -> Arc<PolicySnapshot> {
        if self.is_fresh() {
            return self.current();
        }

        if !self.ever_loaded() {
            // Nothing to serve yet: wait for the first load, bounded by the
            // reload timeout of whichever task holds the lock
            let _guard = self.refresh_lock.lock().await;
            if self.ever_loaded() {
                return self.current();
            }
            return self.reload_or_keep().await;
        }

        // Someone else is already reloading
        let Ok(guard) = Arc::clone(&self.refresh_lock).try_lock_owned() else {
            return self.current();
        };
        // Another task may have reloaded between the check and the lock
        if self.is_fresh() {
            return self.current();
        }

        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let _guard = guard;
            cache.reload_or_keep().await;
        });
        self.current()
    }

    /// Reload from the store now, regardless of freshness.
    pub async fn refresh(&self) -> Result<Arc<PolicySnapshot>> {
        let _guard = self.refresh_lock.lock().await;
        self.bounded_reload().await
    }

    /// Mark the snapshot stale; the next read reloads it.
    pub fn invalidate(&self) {
        debug!(version = self.version(), "Policy snapshot invalidated");
        self.invalidated.store(true, Ordering::Release);
    }

    async fn reload_or_keep(&self) -> Arc<PolicySnapshot> {
        match self.bounded_reload().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let kept = self.current();
                self.audit.record(AuditEvent::PolicyReloadRejected {
                    error: e.to_string(),
                    kept_version: kept.version(),
                    at: Utc::now(),
                });
                *self.checked_at.lock() = Some(Instant::now());
                kept
            }
        }
    }

    async fn bounded_reload(&self) -> Result<Arc<PolicySnapshot>> {
        match tokio::time::timeout(self.reload_timeout, self.reload()).await {
            Ok(result) => result,
            Err(_) => Err(TollgateError::PolicyStore(format!(
                "policy load did not finish within {:?}",
                self.reload_timeout
            ))),
        }
    }

    async fn reload(&self) -> Result<Arc<PolicySnapshot>> {
        // Cleared up front so an invalidation that lands mid-load is kept
        self.invalidated.store(false, Ordering::Release);
        let policies = self.store.load_policies().await?;
        let version = self.version() + 1;
        let snapshot = Arc::new(PolicySnapshot::new(version, policies));

        *self.current.write() = Arc::clone(&snapshot);
        *self.checked_at.lock() = Some(Instant::now());

        info!(
            version = version,
            active_policies = snapshot.len(),
            "Installed policy snapshot"
        );
        Ok(snapshot)
    }
}
