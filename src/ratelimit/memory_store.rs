//! In-process counter store.
//!
//! Counters live in a sharded concurrent map. The shard lock taken by
//! `DashMap::entry` makes reset-increment-check a single atomic step per
//! key, so concurrent callers in one process can never race past a limit.
//! This store has no native TTL: expired rows are ignored on every
//! increment and physically removed by the reaper.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::trace;

use super::counter::{Counter, CounterKey, CounterOutcome, CounterRequest, CounterState};
use super::store::CounterStore;
use crate::error::Result;

/// Counter store backed by a concurrent hash map.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    counters: DashMap<CounterKey, Counter>,
}

impl MemoryCounterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically increment and judge one counter.
    pub fn increment(&self, request: &CounterRequest) -> CounterOutcome {
        let mut entry = self
            .counters
            .entry(request.key.clone())
            .or_insert_with(|| Counter::new(request.window, request.is_authenticated));
        let counter = entry.value_mut();

        // A row from an ended window (or from a policy with a different
        // window size) starts over. A row from a later window than the
        // caller computed is kept: windows never move backwards.
        if counter.window != request.window
            && (counter.is_expired_at(request.now)
                || counter.window.size_secs() != request.window.size_secs())
        {
            *counter = Counter::new(request.window, request.is_authenticated);
        }

        counter.requests_count = counter.requests_count.saturating_add(1);
        counter.is_authenticated = request.is_authenticated;

        trace!(
            key = %request.key,
            count = counter.requests_count,
            window_start = counter.window.start(),
            "Incremented in-memory counter"
        );

        CounterOutcome::evaluate(
            counter.requests_count,
            request.limit,
            counter.window,
            request.now,
        )
    }

    /// Get a copy of the stored row, expired or not.
    pub fn counter(&self, key: &CounterKey) -> Option<Counter> {
        self.counters.get(key).map(|c| c.value().clone())
    }

    /// The live count for a key; expired rows count as zero.
    pub fn current_count(&self, key: &CounterKey, now: DateTime<Utc>) -> u64 {
        self.counters
            .get(key)
            .filter(|c| !c.is_expired_at(now))
            .map(|c| c.requests_count)
            .unwrap_or(0)
    }

    /// Lifecycle state of a key at `now`.
    pub fn state(&self, key: &CounterKey, limit: u64, now: DateTime<Utc>) -> CounterState {
        self.counters
            .get(key)
            .map(|c| c.state_at(now, limit))
            .unwrap_or(CounterState::Absent)
    }

    /// Remove up to `batch_size` expired rows.
    pub fn purge(&self, now: DateTime<Utc>, batch_size: usize) -> usize {
        let expired: Vec<CounterKey> = self
            .counters
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .take(batch_size)
            .collect();

        // Re-check under the shard lock: the row may have been restarted in
        // a fresh window since it was collected.
        expired
            .iter()
            .filter(|key| {
                self.counters
                    .remove_if(*key, |_, counter| counter.is_expired_at(now))
                    .is_some()
            })
            .count()
    }

    /// Number of stored rows, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_check(&self, request: &CounterRequest) -> Result<CounterOutcome> {
        Ok(self.increment(request))
    }

    async fn purge_expired(&self, now: DateTime<Utc>, batch_size: usize) -> Result<usize> {
        Ok(self.purge(now, batch_size))
    }

    fn has_native_ttl(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
