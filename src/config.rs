//! Configuration management for Tollgate.
//!
//! Settings come from an optional YAML file layered under environment
//! variables of the form `TOLLGATE__SECTION__KEY` (for example
//! `TOLLGATE__STORE__BACKEND=redis`). Every field has a default, so an
//! empty configuration is valid.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{FailureMode, Quota};

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission gate behaviour
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Policy source and caching
    #[serde(default)]
    pub policies: PolicySourceConfig,

    /// Counter store backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Background expiry of stale counters
    #[serde(default)]
    pub reaper: ReaperConfig,

    /// Optional gossip mesh for policy invalidation
    #[serde(default)]
    pub cluster: ClusterSettings,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Admission gate configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// What to do when the counter store errors or times out
    #[serde(default)]
    pub fallback: FailureMode,

    /// Upper bound on a single counter store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Quota applied when no policy matches. `None` means "no limit".
    #[serde(default)]
    pub default_quota: Option<QuotaConfig>,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            fallback: FailureMode::default(),
            store_timeout_ms: default_store_timeout_ms(),
            default_quota: None,
        }
    }
}

impl AdmissionConfig {
    /// The store call timeout as a `Duration`.
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_store_timeout_ms() -> u64 {
    50
}

/// A strict quota used when no policy matches a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub requests_limit: u64,
    pub window_size_seconds: u64,
}

impl QuotaConfig {
    /// Convert to the resolver's quota type, rejecting non-positive values.
    pub fn to_quota(&self) -> Result<Quota> {
        Quota::new(self.requests_limit, self.window_size_seconds, None)
    }
}

/// Where policies come from and how long a loaded snapshot stays fresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicySourceConfig {
    /// Path to the policy YAML file; no file means an empty policy set
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Snapshot cache TTL in seconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,

    /// Bound on a single policy load, in milliseconds
    #[serde(default = "default_reload_timeout")]
    pub reload_timeout_ms: u64,
}

impl Default for PolicySourceConfig {
    fn default() -> Self {
        Self {
            path: None,
            cache_ttl_secs: default_cache_ttl(),
            reload_timeout_ms: default_reload_timeout(),
        }
    }
}

impl PolicySourceConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reload_timeout(&self) -> Duration {
        Duration::from_millis(self.reload_timeout_ms)
    }
}

fn default_cache_ttl() -> u64 {
    5
}

fn default_reload_timeout() -> u64 {
    1000
}

/// Which counter store backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process sharded map; correct for a single instance only
    #[default]
    Memory,
    /// Shared Redis instance; correct across processes
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL, required for the redis backend
    #[serde(default)]
    pub redis_url: Option<String>,

    /// Prefix for every Redis key written by the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

/// Reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReaperConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Seconds between sweeps
    #[serde(default = "default_reaper_interval")]
    pub interval_secs: u64,

    /// Maximum rows deleted per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_reaper_interval(),
            batch_size: default_batch_size(),
        }
    }
}

impl ReaperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_true() -> bool {
    true
}

fn default_reaper_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    500
}

/// Gossip mesh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Unique node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    #[serde(default = "default_gossip_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to `listen_addr`
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval_ms")]
    pub gossip_interval_ms: u64,

    /// How often the local node looks for a newer invalidation epoch
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            node_id: None,
            listen_addr: default_gossip_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl ClusterSettings {
    /// Build the mesh configuration for this node.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: defaults.dead_node_grace_period,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_gossip_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "tollgate".to_string()
}

fn default_gossip_interval_ms() -> u64 {
    100
}

fn default_poll_interval_ms() -> u64 {
    500
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus `TOLLGATE__*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("TOLLGATE")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("cluster.seed_nodes"),
            )
            .build()?;

        let config: TollgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string, without environment overrides.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()?;
        let config: TollgateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the gate or reaper misbehave.
    pub fn validate(&self) -> Result<()> {
        if self.admission.store_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "admission.store_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if let Some(quota) = &self.admission.default_quota {
            quota.to_quota().map_err(|e| {
                TollgateError::Config(format!("admission.default_quota: {}", e))
            })?;
        }
        if self.policies.cache_ttl_secs == 0 {
            return Err(TollgateError::Config(
                "policies.cache_ttl_secs must be greater than 0".to_string(),
            ));
        }
        if self.policies.reload_timeout_ms == 0 {
            return Err(TollgateError::Config(
                "policies.reload_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_none() {
            return Err(TollgateError::Config(
                "store.redis_url is required when store.backend is redis".to_string(),
            ));
        }
        if self.reaper.enabled && (self.reaper.interval_secs == 0 || self.reaper.batch_size == 0) {
            return Err(TollgateError::Config(
                "reaper.interval_secs and reaper.batch_size must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
