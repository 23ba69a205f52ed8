//! Peer mesh networking module using Chitchat.
//!
//! Nodes gossip a policy invalidation epoch so that an operator's
//! invalidation on one node reaches every node's policy cache. Delivery is
//! best-effort; each cache still expires on its own TTL.

mod cluster;
mod invalidation;

pub use cluster::{Cluster, ClusterConfig, ClusterError, POLICY_EPOCH_KEY};
pub use invalidation::spawn_invalidation_watch;
