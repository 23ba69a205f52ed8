//! Counter store trait for abstracting in-process and shared backends.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::counter::{CounterOutcome, CounterRequest};
use crate::error::Result;

/// Shared, atomically updated usage counters.
///
/// Implementations must perform the increment and the limit check as one
/// atomic step at the store: the count is always incremented, including for
/// requests that end up denied, and the check runs against the
/// post-increment value. A counter whose window has ended must read as
/// absent, whether or not it has been physically removed yet.
#[async_trait]
pub trait CounterStore: Send + Sync + std::fmt::Debug {
    /// Increment the counter for `request.key` in `request.window` and judge
    /// the new count against `request.limit`.
    async fn increment_and_check(&self, request: &CounterRequest) -> Result<CounterOutcome>;

    /// Delete up to `batch_size` counters whose window ended at or before
    /// `now`, returning how many were removed.
    ///
    /// Must tolerate rows that disappear concurrently.
    async fn purge_expired(&self, now: DateTime<Utc>, batch_size: usize) -> Result<usize>;

    /// Whether the backend expires counters on its own, making the reaper
    /// unnecessary.
    fn has_native_ttl(&self) -> bool;

    /// Short backend name for logs and metrics.
    fn name(&self) -> &'static str;
}
