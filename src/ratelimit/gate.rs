//! The admission gate.
//!
//! Every protected request passes through [`AdmissionGate::admit`]: resolve
//! the governing quota, atomically count the request, and allow or deny it.
//! If the counter store fails or does not answer within the store timeout,
//! the fallback mode decides instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, trace};

use super::audit::{AuditEvent, AuditSink, TracingAuditSink};
use super::clock::{Clock, SystemClock};
use super::counter::{CounterOutcome, CounterRequest};
use super::metrics::GateMetrics;
use super::policy::FailureMode;
use super::request::AdmissionRequest;
use super::resolver::{PolicyResolver, Quota, Resolution};
use super::store::CounterStore;
use crate::error::{Result, TollgateError};

/// Default bound on a single counter store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(50);

/// Gate behaviour that is not part of any policy.
#[derive(Debug, Clone, Copy)]
pub struct GateSettings {
    pub store_timeout: Duration,
    /// Applied on store failure unless the policy overrides it
    pub fallback: FailureMode,
}

impl Default for GateSettings {
    fn default() -> Self {
        Self {
            store_timeout: DEFAULT_STORE_TIMEOUT,
            fallback: FailureMode::FailOpen,
        }
    }
}

/// How a request was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// No policy applied
    Unlimited,
    Allowed,
    Denied,
    /// Store failed, allowed by fallback
    FailedOpen,
    /// Store failed, denied by fallback
    FailedClosed,
}

/// Quota figures reported back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuotaStatus {
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the current window ends
    pub retry_after_secs: u64,
}

/// The gate's answer for one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    pub outcome: Outcome,
    /// Absent for unlimited and fail-open decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaStatus>,
    /// Pattern of the policy that applied, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
}

impl Decision {
    fn unlimited() -> Self {
        Self {
            outcome: Outcome::Unlimited,
            quota: None,
            policy: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(
            self.outcome,
            Outcome::Unlimited | Outcome::Allowed | Outcome::FailedOpen
        )
    }

    /// Headers are only meaningful when a counter was consulted or the
    /// request was denied.
    pub fn quota(&self) -> Option<&QuotaStatus> {
        self.quota.as_ref()
    }
}

/// The single enforcement point for request admission.
#[derive(Debug)]
pub struct AdmissionGate {
    resolver: PolicyResolver,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    settings: GateSettings,
    metrics: GateMetrics,
    audit: Arc<dyn AuditSink>,
}

impl AdmissionGate {
    pub fn new(resolver: PolicyResolver, store: Arc<dyn CounterStore>) -> Self {
        Self {
            resolver,
            store,
            clock: Arc::new(SystemClock::new()),
            settings: GateSettings::default(),
            metrics: GateMetrics::new(),
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_settings(mut self, settings: GateSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_metrics(mut self, metrics: GateMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    pub fn resolver(&self) -> &PolicyResolver {
        &self.resolver
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    pub fn settings(&self) -> GateSettings {
        self.settings
    }

    /// Decide whether `request` may proceed.
    ///
    /// The counter is incremented even when the request ends up denied, and
    /// nothing is refunded if the caller goes away afterwards.
    pub async fn admit(&self, request: &AdmissionRequest) -> Decision {
        let resolved = match self.resolver.resolve(request).await {
            Resolution::Unlimited => {
                trace!(endpoint = %request.endpoint, "No policy matched");
                self.metrics.record_unlimited();
                return Decision::unlimited();
            }
            Resolution::Limited(resolved) => resolved,
        };

        let quota = resolved.quota;
        let now = self.clock.now();
        let counter_request = CounterRequest::new(request, quota.limit, quota.window_secs, now);

        match self.increment(&counter_request).await {
            Ok(outcome) => self.judge(request, resolved.pattern, outcome),
            Err(e) => self.fall_back(request, quota, resolved.pattern, &counter_request, now, e),
        }
    }

    async fn increment(&self, request: &CounterRequest) -> Result<CounterOutcome> {
        match tokio::time::timeout(
            self.settings.store_timeout,
            self.store.increment_and_check(request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(TollgateError::StoreUnavailable(format!(
                "{} store did not answer within {:?}",
                self.store.name(),
                self.settings.store_timeout
            ))),
        }
    }

    fn judge(
        &self,
        request: &AdmissionRequest,
        policy: Option<String>,
        outcome: CounterOutcome,
    ) -> Decision {
        let status = QuotaStatus {
            limit: outcome.limit,
            remaining: outcome.remaining,
            retry_after_secs: outcome.retry_after_secs,
        };

        if outcome.allowed {
            trace!(
                entity = %request.principal(),
                endpoint = %request.endpoint,
                count = outcome.count,
                limit = outcome.limit,
                "Request admitted"
            );
            self.metrics.record_allowed();
            Decision {
                outcome: Outcome::Allowed,
                quota: Some(status),
                policy,
            }
        } else {
            info!(
                entity = %request.principal(),
                endpoint = %request.endpoint,
                count = outcome.count,
                limit = outcome.limit,
                retry_after_secs = outcome.retry_after_secs,
                "Rate limit exceeded"
            );
            self.metrics.record_denied();
            Decision {
                outcome: Outcome::Denied,
                quota: Some(status),
                policy,
            }
        }
    }

    fn fall_back(
        &self,
        request: &AdmissionRequest,
        quota: Quota,
        policy: Option<String>,
        counter_request: &CounterRequest,
        now: DateTime<Utc>,
        error: TollgateError,
    ) -> Decision {
        let mode = quota.failure_mode.unwrap_or(self.settings.fallback);

        self.metrics.record_store_error();
        self.audit.record(AuditEvent::StoreFallback {
            entity: request.principal().to_string(),
            endpoint: request.endpoint.as_key(),
            mode,
            store: self.store.name(),
            error: error.to_string(),
            at: now,
        });

        match mode {
            FailureMode::FailOpen => {
                self.metrics.record_failed_open();
                Decision {
                    outcome: Outcome::FailedOpen,
                    quota: None,
                    policy,
                }
            }
            FailureMode::FailClosed => {
                self.metrics.record_failed_closed();
                Decision {
                    outcome: Outcome::FailedClosed,
                    quota: Some(QuotaStatus {
                        limit: quota.limit,
                        remaining: 0,
                        retry_after_secs: counter_request.window.retry_after_secs(now),
                    }),
                    policy,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::audit::MemoryAuditSink;
    use crate::ratelimit::clock::MockClock;
    use crate::ratelimit::memory_store::MemoryCounterStore;
    use crate::ratelimit::policy::{EntityType, Policy};
    use crate::ratelimit::policy_store::{PolicyStore, StaticPolicyStore};
    use crate::ratelimit::request::{Endpoint, Principal};
    use crate::ratelimit::snapshot::PolicyCache;
    use async_trait::async_trait;
    use proptest::prelude::*;

    /// Window start used by the tests: a multiple of 60.
    const T0: i64 = 1_700_000_040;

    #[derive(Debug)]
    struct BrokenStore;

    #[async_trait]
    impl CounterStore for BrokenStore {
        async fn increment_and_check(&self, _request: &CounterRequest) -> Result<CounterOutcome> {
            Err(TollgateError::StoreUnavailable("connection refused".to_string()))
        }

        async fn purge_expired(&self, _now: DateTime<Utc>, _batch_size: usize) -> Result<usize> {
            Ok(0)
        }

        fn has_native_ttl(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "broken"
        }
    }

    #[derive(Debug)]
    struct SlowStore;

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn increment_and_check(&self, request: &CounterRequest) -> Result<CounterOutcome> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(CounterOutcome::evaluate(1, request.limit, request.window, request.now))
        }

        async fn purge_expired(&self, _now: DateTime<Utc>, _batch_size: usize) -> Result<usize> {
            Ok(0)
        }

        fn has_native_ttl(&self) -> bool {
            true
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    fn resolver(policies: Vec<Policy>) -> PolicyResolver {
        let store = Arc::new(StaticPolicyStore::new(policies));
        PolicyResolver::new(Arc::new(PolicyCache::new(store, Duration::from_secs(5))))
    }

    fn login_policy() -> Policy {
        Policy::try_new(EntityType::Ip, "POST /api/v1/auth/login", 5, 60).unwrap()
    }

    fn login_request() -> AdmissionRequest {
        AdmissionRequest::new(
            &Principal::ip("203.0.113.7"),
            Endpoint::new("POST", "/api/v1/auth/login"),
        )
    }

    fn memory_gate(policies: Vec<Policy>, clock: Arc<MockClock>) -> AdmissionGate {
        AdmissionGate::new(resolver(policies), Arc::new(MemoryCounterStore::new()))
            .with_clock(clock)
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let clock = Arc::new(MockClock::at_secs(T0));
        let gate = memory_gate(vec![login_policy()], clock.clone());
        let request = login_request();

        for expected_remaining in [4, 3, 2, 1, 0] {
            clock.advance(Duration::from_secs(2));
            let decision = gate.admit(&request).await;
            assert_eq!(decision.outcome, Outcome::Allowed);
            let quota = decision.quota().unwrap();
            assert_eq!(quota.limit, 5);
            assert_eq!(quota.remaining, expected_remaining);
        }

        // Sixth request at T0 + 10s
        let decision = gate.admit(&request).await;
        assert_eq!(decision.outcome, Outcome::Denied);
        assert!(!decision.is_allowed());
        let quota = decision.quota().unwrap();
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.retry_after_secs, 50);
        assert_eq!(decision.policy.as_deref(), Some("POST /api/v1/auth/login"));

        assert_eq!(gate.metrics().allowed(), 5);
        assert_eq!(gate.metrics().denied(), 1);
    }

    #[tokio::test]
    async fn test_window_rollover_restores_quota() {
        let clock = Arc::new(MockClock::at_secs(T0));
        let gate = memory_gate(vec![login_policy()], clock.clone());
        let request = login_request();

        for _ in 0..7 {
            gate.admit(&request).await;
        }
        assert_eq!(gate.admit(&request).await.outcome, Outcome::Denied);

        clock.advance(Duration::from_secs(60));
        let decision = gate.admit(&request).await;
        assert_eq!(decision.outcome, Outcome::Allowed);
        assert_eq!(decision.quota().unwrap().remaining, 4);
    }

    #[tokio::test]
    async fn test_unmatched_request_is_unlimited() {
        let clock = Arc::new(MockClock::at_secs(T0));
        let gate = memory_gate(vec![login_policy()], clock);
        let request = AdmissionRequest::new(
            &Principal::ip("203.0.113.7"),
            Endpoint::new("GET", "/api/v1/products"),
        );

        for _ in 0..100 {
            let decision = gate.admit(&request).await;
            assert_eq!(decision.outcome, Outcome::Unlimited);
            assert!(decision.quota().is_none());
        }
        assert_eq!(gate.metrics().unlimited(), 100);
    }

    #[tokio::test]
    async fn test_entities_counted_separately() {
        let clock = Arc::new(MockClock::at_secs(T0));
        let gate = memory_gate(vec![login_policy()], clock);
        let first = login_request();
        let second = AdmissionRequest::new(
            &Principal::ip("198.51.100.9"),
            Endpoint::new("POST", "/api/v1/auth/login"),
        );

        for _ in 0..5 {
            assert!(gate.admit(&first).await.is_allowed());
        }
        assert!(!gate.admit(&first).await.is_allowed());
        assert!(gate.admit(&second).await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_failure_fails_open_by_default() {
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = AdmissionGate::new(resolver(vec![login_policy()]), Arc::new(BrokenStore))
            .with_clock(Arc::new(MockClock::at_secs(T0)))
            .with_audit(audit.clone());

        let decision = gate.admit(&login_request()).await;
        assert_eq!(decision.outcome, Outcome::FailedOpen);
        assert!(decision.is_allowed());
        assert!(decision.quota().is_none());

        assert_eq!(audit.len(), 1);
        match &audit.events()[0] {
            AuditEvent::StoreFallback {
                entity,
                endpoint,
                mode,
                store,
                ..
            } => {
                assert_eq!(entity, "ip:203.0.113.7");
                assert_eq!(endpoint, "POST /api/v1/auth/login");
                assert_eq!(*mode, FailureMode::FailOpen);
                assert_eq!(*store, "broken");
            }
            other => panic!("unexpected audit event {:?}", other),
        }
        assert_eq!(gate.metrics().failed_open(), 1);
        assert_eq!(gate.metrics().store_errors(), 1);
    }

    #[tokio::test]
    async fn test_store_failure_fails_closed_when_configured() {
        let gate = AdmissionGate::new(resolver(vec![login_policy()]), Arc::new(BrokenStore))
            .with_clock(Arc::new(MockClock::at_secs(T0 + 10)))
            .with_audit(Arc::new(MemoryAuditSink::new()))
            .with_settings(GateSettings {
                fallback: FailureMode::FailClosed,
                ..GateSettings::default()
            });

        let decision = gate.admit(&login_request()).await;
        assert_eq!(decision.outcome, Outcome::FailedClosed);
        let quota = decision.quota().unwrap();
        assert_eq!(quota.limit, 5);
        assert_eq!(quota.remaining, 0);
        assert_eq!(quota.retry_after_secs, 50);
    }

    #[tokio::test]
    async fn test_policy_override_beats_global_fallback() {
        let policy = login_policy().with_failure_mode(FailureMode::FailClosed);
        let gate = AdmissionGate::new(resolver(vec![policy]), Arc::new(BrokenStore))
            .with_clock(Arc::new(MockClock::at_secs(T0)))
            .with_audit(Arc::new(MemoryAuditSink::new()));

        let decision = gate.admit(&login_request()).await;
        assert_eq!(decision.outcome, Outcome::FailedClosed);

        let policy = login_policy().with_failure_mode(FailureMode::FailOpen);
        let gate = AdmissionGate::new(resolver(vec![policy]), Arc::new(BrokenStore))
            .with_clock(Arc::new(MockClock::at_secs(T0)))
            .with_audit(Arc::new(MemoryAuditSink::new()))
            .with_settings(GateSettings {
                fallback: FailureMode::FailClosed,
                ..GateSettings::default()
            });

        let decision = gate.admit(&login_request()).await;
        assert_eq!(decision.outcome, Outcome::FailedOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_timeout_applies_fallback() {
        let audit = Arc::new(MemoryAuditSink::new());
        let gate = AdmissionGate::new(resolver(vec![login_policy()]), Arc::new(SlowStore))
            .with_clock(Arc::new(MockClock::at_secs(T0)))
            .with_audit(audit.clone());

        let decision = gate.admit(&login_request()).await;
        assert_eq!(decision.outcome, Outcome::FailedOpen);
        assert_eq!(audit.len(), 1);
    }

    /// Serves one policy load, then never answers again.
    #[derive(Debug, Default)]
    struct StallingPolicyStore {
        loaded: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl PolicyStore for StallingPolicyStore {
        async fn load_policies(&self) -> Result<Vec<Policy>> {
            if self.loaded.swap(true, std::sync::atomic::Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            Ok(vec![login_policy()])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_policy_store_does_not_block_admission() {
        let cache = Arc::new(PolicyCache::new(
            Arc::new(StallingPolicyStore::default()),
            Duration::from_secs(5),
        ));
        let gate = AdmissionGate::new(
            PolicyResolver::new(cache.clone()),
            Arc::new(MemoryCounterStore::new()),
        )
        .with_clock(Arc::new(MockClock::at_secs(T0)));
        let store_timeout = gate.settings().store_timeout;

        assert_eq!(gate.admit(&login_request()).await.outcome, Outcome::Allowed);

        // Past the TTL the reload hangs, but decisions keep using the old snapshot
        tokio::time::advance(Duration::from_secs(6)).await;
        for _ in 0..3 {
            let decision = tokio::time::timeout(store_timeout, gate.admit(&login_request()))
                .await
                .unwrap();
            assert_eq!(decision.outcome, Outcome::Allowed);
            assert_eq!(decision.policy.as_deref(), Some("POST /api/v1/auth/login"));
        }
        assert_eq!(cache.version(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_requests_admit_exactly_limit() {
        let policy = Policy::try_new(EntityType::Ip, "POST /api/v1/auth/login", 25, 60).unwrap();
        let gate = Arc::new(memory_gate(vec![policy], Arc::new(MockClock::at_secs(T0))));

        let mut handles = Vec::new();
        for _ in 0..200 {
            let gate = Arc::clone(&gate);
            handles.push(tokio::spawn(async move {
                gate.admit(&login_request()).await.is_allowed()
            }));
        }

        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 25);
        assert_eq!(gate.metrics().denied(), 175);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_first_limit_requests_allowed(
            limit in 1u64..30,
            extra in 0u64..10,
            offset in 0i64..60,
        ) {
            tokio_test::block_on(async {
                let policy = Policy::try_new(
                    EntityType::Ip,
                    "POST /api/v1/auth/login",
                    limit as i64,
                    60,
                )
                .unwrap();
                let gate = memory_gate(vec![policy], Arc::new(MockClock::at_secs(T0 + offset)));

                for i in 0..limit + extra {
                    let decision = gate.admit(&login_request()).await;
                    let quota = decision.quota().unwrap();
                    if i < limit {
                        assert_eq!(decision.outcome, Outcome::Allowed);
                        assert_eq!(quota.remaining, limit - 1 - i);
                    } else {
                        assert_eq!(decision.outcome, Outcome::Denied);
                        assert_eq!(quota.retry_after_secs, (60 - offset) as u64);
                    }
                }
            });
        }
    }
}
