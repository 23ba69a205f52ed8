//! Admission control: policies, counters and the gate that enforces them.

mod audit;
mod clock;
mod counter;
mod gate;
mod memory_store;
mod metrics;
mod policy;
mod policy_store;
mod reaper;
mod redis_store;
mod request;
mod resolver;
mod snapshot;
mod store;

pub use audit::{AuditEvent, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use clock::{Clock, MockClock, SystemClock};
pub use counter::{
    Counter, CounterKey, CounterOutcome, CounterRequest, CounterState, FixedWindow,
};
pub use gate::{AdmissionGate, Decision, GateSettings, Outcome, QuotaStatus, DEFAULT_STORE_TIMEOUT};
pub use memory_store::MemoryCounterStore;
pub use metrics::{GateMetrics, MetricsSnapshot};
pub use policy::{
    EndpointPattern, EntityType, FailureMode, PathMatch, Policy, PolicyDefinition, PolicyFile,
    Specificity, WILDCARD,
};
pub use policy_store::{FilePolicyStore, PolicyStore, StaticPolicyStore};
pub use reaper::Reaper;
pub use redis_store::{RedisCounterStore, RedisStoreConfig};
pub use request::{AdmissionRequest, Endpoint, Principal};
pub use resolver::{most_specific, PolicyResolver, Quota, Resolution, ResolvedPolicy};
pub use snapshot::{PolicyCache, PolicySnapshot, DEFAULT_RELOAD_TIMEOUT};
pub use store::CounterStore;
