//! Redis-backed counter store.
//!
//! Shares counters across every Tollgate instance pointed at the same
//! Redis. Each fixed window gets its own key, so the atomic primitive is a
//! single Lua script: `INCR`, then `EXPIRE` only when the key was just
//! created. Redis expires keys on its own; the reaper is not needed.
//!
//! Key layout: `{prefix}{entity_type}:{entity_identifier}|{endpoint}|{window_size}:{window_start}`

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::fmt;
use tracing::{debug, info};

use super::counter::{CounterOutcome, CounterRequest};
use super::store::CounterStore;
use crate::error::Result;

const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('EXPIRE', KEYS[1], tonumber(ARGV[1]))
end
return current
"#;

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix for every key this store writes (default: "tollgate:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "tollgate:".to_string(),
        }
    }
}

/// Counter store backed by Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: ConnectionManager,
    script: Script,
    config: RedisStoreConfig,
}

impl fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCounterStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect with default configuration.
    pub async fn connect(url: &str) -> Result<Self> {
        Self::connect_with_config(url, RedisStoreConfig::default()).await
    }

    /// Connect with custom configuration.
    pub async fn connect_with_config(url: &str, config: RedisStoreConfig) -> Result<Self> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            script: Script::new(INCREMENT_SCRIPT),
            config,
        })
    }

    /// The Redis key holding the counter for `request`'s window.
    pub fn key(&self, request: &CounterRequest) -> String {
        window_key(&self.config.key_prefix, request)
    }
}

fn window_key(prefix: &str, request: &CounterRequest) -> String {
    format!(
        "{}{}|{}:{}",
        prefix,
        request.key,
        request.window.size_secs(),
        request.window.start()
    )
}

/// Seconds the key must live: the rest of the window plus one second of slack.
fn key_ttl_secs(request: &CounterRequest) -> u64 {
    request.window.retry_after_secs(request.now) + 1
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment_and_check(&self, request: &CounterRequest) -> Result<CounterOutcome> {
        let key = self.key(request);
        let mut connection = self.connection.clone();

        let count: u64 = self
            .script
            .key(&key)
            .arg(key_ttl_secs(request))
            .invoke_async(&mut connection)
            .await?;

        debug!(key = %key, count = count, "Incremented Redis counter");

        Ok(CounterOutcome::evaluate(
            count,
            request.limit,
            request.window,
            request.now,
        ))
    }

    async fn purge_expired(&self, _now: DateTime<Utc>, _batch_size: usize) -> Result<usize> {
        Ok(0)
    }

    fn has_native_ttl(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}
