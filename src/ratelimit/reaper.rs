//! Background removal of expired counters.
//!
//! Correctness never depends on the reaper: stores treat expired rows as
//! absent on their own. The reaper only bounds storage growth for stores
//! without native TTL.

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::clock::{Clock, SystemClock};
use super::metrics::GateMetrics;
use super::store::CounterStore;
use crate::error::Result;

/// Upper bound on batches per sweep, so one sweep cannot run forever while
/// traffic keeps creating rows.
const MAX_BATCHES_PER_SWEEP: usize = 1024;

/// Periodically purges expired counters from a [`CounterStore`].
#[derive(Debug, Clone)]
pub struct Reaper {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
    metrics: GateMetrics,
}

impl Reaper {
    pub fn new(store: Arc<dyn CounterStore>, interval: Duration, batch_size: usize) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock::new()),
            interval,
            batch_size: batch_size.max(1),
            metrics: GateMetrics::new(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Whether this store needs reaping at all.
    pub fn is_needed(&self) -> bool {
        !self.store.has_native_ttl()
    }

    /// One sweep: purge batches until one comes back short.
    pub async fn run_once(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut total = 0;

        for _ in 0..MAX_BATCHES_PER_SWEEP {
            let removed = self.store.purge_expired(now, self.batch_size).await?;
            total += removed;
            if removed < self.batch_size {
                break;
            }
            tokio::task::yield_now().await;
        }

        if total > 0 {
            self.metrics.record_reaped(total);
            debug!(store = self.store.name(), removed = total, "Reaped expired counters");
        }
        Ok(total)
    }

    /// Run sweeps every interval until `shutdown` flips to `true`.
    ///
    /// Returns `None` without spawning when the store expires keys natively.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if !self.is_needed() {
            info!(store = self.store.name(), "Store has native TTL, reaper not started");
            return None;
        }

        Some(tokio::spawn(async move {
            let jitter = initial_jitter(self.interval);
            info!(
                store = self.store.name(),
                interval_secs = self.interval.as_secs(),
                batch_size = self.batch_size,
                "Starting counter reaper"
            );

            let start = tokio::time::Instant::now() + jitter;
            let period = self.interval.max(Duration::from_millis(1));
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_once().await {
                            warn!(error = %e, "Counter reaper sweep failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Counter reaper stopped");
                            break;
                        }
                    }
                }
            }
        }))
    }
}

/// Random delay in `[0, interval)` before the first sweep.
fn initial_jitter(interval: Duration) -> Duration {
    let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..millis))
}
