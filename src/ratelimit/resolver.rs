//! Policy resolution.
//!
//! Among the active policies for a request's entity type, the most specific
//! matching pattern wins: an exact path beats any wildcard, a longer
//! wildcard literal beats a shorter one, and a method-qualified pattern beats
//! an unqualified one. Remaining ties go to the stricter policy (smaller
//! limit, then smaller window), and finally to pattern text, so the choice
//! never depends on the order policies were stored in.

use serde::Serialize;
use std::sync::Arc;
use tracing::trace;

use super::policy::{FailureMode, Policy};
use super::request::AdmissionRequest;
use super::snapshot::PolicyCache;
use crate::error::{Result, TollgateError};

/// The limit a request is held to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub limit: u64,
    pub window_secs: u64,
    /// Overrides the gate's global fallback when set
    pub failure_mode: Option<FailureMode>,
}

impl Quota {
    pub fn new(limit: u64, window_secs: u64, failure_mode: Option<FailureMode>) -> Result<Self> {
        if limit == 0 {
            return Err(TollgateError::InvalidPolicy(
                "quota limit must be greater than 0".to_string(),
            ));
        }
        if window_secs == 0 {
            return Err(TollgateError::InvalidPolicy(
                "quota window must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            limit,
            window_secs,
            failure_mode,
        })
    }

    pub fn from_policy(policy: &Policy) -> Self {
        Self {
            limit: policy.requests_limit,
            window_secs: policy.window_size_seconds,
            failure_mode: policy.failure_mode,
        }
    }
}

/// The most specific active policy in `policies` matching `request`.
///
/// Only policies for the request's entity type are considered.
pub fn most_specific<'a>(
    policies: &'a [Policy],
    request: &AdmissionRequest,
) -> Option<&'a Policy> {
    policies
        .iter()
        .filter(|p| p.is_active && p.entity_type == request.entity_type)
        .filter_map(|p| p.endpoint_pattern.matches(&request.endpoint).map(|s| (s, p)))
        // max_by keeps the greatest; reversing tie_break makes the stricter
        // policy the greatest among equal specificities
        .max_by(|(sa, pa), (sb, pb)| sa.cmp(sb).then_with(|| pb.tie_break(pa)))
        .map(|(_, p)| p)
}

/// What the resolver decided for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// No policy applies and there is no default quota
    Unlimited,
    Limited(ResolvedPolicy),
}

/// A quota together with the pattern it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPolicy {
    pub quota: Quota,
    /// `None` when the configured default quota applied
    pub pattern: Option<String>,
    pub snapshot_version: u64,
}

/// Picks the governing quota for each request from the cached snapshot.
#[derive(Debug)]
pub struct PolicyResolver {
    cache: Arc<PolicyCache>,
    default_quota: Option<Quota>,
}

impl PolicyResolver {
    pub fn new(cache: Arc<PolicyCache>) -> Self {
        Self {
            cache,
            default_quota: None,
        }
    }

    /// Apply `quota` to requests no policy matches, instead of leaving them
    /// unlimited.
    pub fn with_default_quota(mut self, quota: Option<Quota>) -> Self {
        self.default_quota = quota;
        self
    }

    pub fn cache(&self) -> &Arc<PolicyCache> {
        &self.cache
    }

    pub async fn resolve(&self, request: &AdmissionRequest) -> Resolution {
        let snapshot = self.cache.snapshot().await;

        match snapshot.find(request) {
            Some(policy) => {
                trace!(
                    endpoint = %request.endpoint,
                    pattern = %policy.endpoint_pattern,
                    version = snapshot.version(),
                    "Resolved policy"
                );
                Resolution::Limited(ResolvedPolicy {
                    quota: Quota::from_policy(policy),
                    pattern: Some(policy.endpoint_pattern.to_string()),
                    snapshot_version: snapshot.version(),
                })
            }
            None => match self.default_quota {
                Some(quota) => Resolution::Limited(ResolvedPolicy {
                    quota,
                    pattern: None,
                    snapshot_version: snapshot.version(),
                }),
                None => Resolution::Unlimited,
            },
        }
    }
}
