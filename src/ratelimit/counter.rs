//! Fixed-window counters.
//!
//! A window of `W` seconds always starts at `floor(now / W) * W` seconds
//! since the Unix epoch. Fixed windows are cheap but let a client spend up
//! to twice its limit across a boundary (a burst at the end of one window
//! followed by a burst at the start of the next).

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::policy::EntityType;
use super::request::AdmissionRequest;

/// One epoch-aligned fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FixedWindow {
    /// Window start, seconds since the epoch
    start: i64,
    /// Window length in seconds, always > 0
    size_secs: u64,
}

impl FixedWindow {
    /// The window of `size_secs` seconds that contains `now`.
    ///
    /// A zero size is treated as one second.
    pub fn containing(now: DateTime<Utc>, size_secs: u64) -> Self {
        let size_secs = size_secs.max(1);
        let size = i64::try_from(size_secs).unwrap_or(i64::MAX);
        let start = now.timestamp().div_euclid(size) * size;
        Self { start, size_secs }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn size_secs(&self) -> u64 {
        self.size_secs
    }

    /// First second past the end of the window.
    pub fn end(&self) -> i64 {
        self.start
            .saturating_add(i64::try_from(self.size_secs).unwrap_or(i64::MAX))
    }

    /// `true` once `now` has reached the end of the window.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp_millis() >= self.end().saturating_mul(1000)
    }

    /// Time left until the window resets.
    pub fn duration_until_reset(&self, now: DateTime<Utc>) -> Duration {
        let remaining_ms = self
            .end()
            .saturating_mul(1000)
            .saturating_sub(now.timestamp_millis());
        Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(0))
    }

    /// Whole seconds a denied client should wait, rounded up and never zero.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        let remaining = self.duration_until_reset(now);
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.max(1)
    }
}

/// Identity of a counter: entity plus the exact endpoint key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct CounterKey {
    pub entity_type: EntityType,
    pub entity_identifier: String,
    pub endpoint: String,
}

impl CounterKey {
    pub fn new(entity_type: EntityType, entity_identifier: &str, endpoint: &str) -> Self {
        Self {
            entity_type,
            entity_identifier: entity_identifier.to_string(),
            endpoint: endpoint.to_string(),
        }
    }

    pub fn for_request(request: &AdmissionRequest) -> Self {
        Self::new(
            request.entity_type,
            &request.entity_identifier,
            &request.endpoint.as_key(),
        )
    }

    /// Convert the key to a string for logging and external stores.
    pub fn to_string_key(&self) -> String {
        format!(
            "{}:{}|{}",
            self.entity_type, self.entity_identifier, self.endpoint
        )
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_string_key())
    }
}

/// Lifecycle of one counter key. `Expired` is derived from time, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    Absent,
    Active,
    LimitReached,
    Expired,
}

/// A stored counter row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Counter {
    pub requests_count: u64,
    pub window: FixedWindow,
    pub is_authenticated: bool,
}

impl Counter {
    /// A fresh counter for `window`, not yet incremented.
    pub fn new(window: FixedWindow, is_authenticated: bool) -> Self {
        Self {
            requests_count: 0,
            window,
            is_authenticated,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.window.is_expired_at(now)
    }

    /// Where this counter sits in its lifecycle at `now`.
    pub fn state_at(&self, now: DateTime<Utc>, limit: u64) -> CounterState {
        if self.is_expired_at(now) {
            CounterState::Expired
        } else if self.requests_count == 0 {
            CounterState::Absent
        } else if self.requests_count >= limit {
            CounterState::LimitReached
        } else {
            CounterState::Active
        }
    }
}

/// Input to a single atomic increment.
#[derive(Debug, Clone)]
pub struct CounterRequest {
    pub key: CounterKey,
    pub is_authenticated: bool,
    pub limit: u64,
    pub window: FixedWindow,
    pub now: DateTime<Utc>,
}

impl CounterRequest {
    pub fn new(
        request: &AdmissionRequest,
        limit: u64,
        window_size_secs: u64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: CounterKey::for_request(request),
            is_authenticated: request.is_authenticated,
            limit,
            window: FixedWindow::containing(now, window_size_secs),
            now,
        }
    }
}

/// Result of an increment: the post-increment count judged against the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CounterOutcome {
    pub count: u64,
    pub limit: u64,
    pub allowed: bool,
    pub remaining: u64,
    pub window: FixedWindow,
    pub retry_after_secs: u64,
}

impl CounterOutcome {
    /// Judge a post-increment `count` within `window`.
    pub fn evaluate(count: u64, limit: u64, window: FixedWindow, now: DateTime<Utc>) -> Self {
        Self {
            count,
            limit,
            allowed: count <= limit,
            remaining: limit.saturating_sub(count),
            window,
            retry_after_secs: window.retry_after_secs(now),
        }
    }
}
