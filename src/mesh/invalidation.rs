//! Propagates policy invalidations from the mesh to the local cache.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cluster::Cluster;
use crate::ratelimit::PolicyCache;

/// Poll the mesh for a higher policy epoch and invalidate `cache` whenever
/// one appears, until `shutdown` flips to `true`.
pub fn spawn_invalidation_watch(
    cluster: Arc<Cluster>,
    cache: Arc<PolicyCache>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut seen = cluster.observed_epoch().await;
        let mut ticker = tokio::time::interval(poll_interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(epoch = seen, "Watching for policy invalidations");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let epoch = cluster.observed_epoch().await;
                    if epoch > seen {
                        debug!(previous = seen, epoch = epoch, "Peer invalidated policies");
                        cache.invalidate();
                        seen = epoch;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
