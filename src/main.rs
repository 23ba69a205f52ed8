use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LogFormat, StoreBackend, TollgateConfig};
use tollgate::http::{AppState, HttpServer};
use tollgate::mesh::{spawn_invalidation_watch, Cluster};
use tollgate::ratelimit::{
    AdmissionGate, CounterStore, FilePolicyStore, GateMetrics, GateSettings, MemoryCounterStore,
    PolicyCache, PolicyResolver, PolicyStore, Reaper, RedisCounterStore, RedisStoreConfig,
    StaticPolicyStore,
};

/// Request admission control service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address for the HTTP service, overriding the configuration
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Path to the policy file, overriding the configuration
    #[arg(long)]
    policies: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TollgateConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    if let Some(path) = args.policies {
        config.policies.path = Some(path);
    }
    if args.log_json {
        config.logging.format = LogFormat::Json;
    }

    init_tracing(&config);

    info!("Starting Tollgate admission control service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let counter_store: Arc<dyn CounterStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryCounterStore::new()),
        StoreBackend::Redis => {
            let url = config
                .store
                .redis_url
                .as_deref()
                .context("store.redis_url is required for the redis backend")?;
            let store_config = RedisStoreConfig {
                key_prefix: config.store.key_prefix.clone(),
            };
            Arc::new(RedisCounterStore::connect_with_config(url, store_config).await?)
        }
    };
    info!(store = counter_store.name(), "Counter store initialized");

    let policy_store: Arc<dyn PolicyStore> = match &config.policies.path {
        Some(path) => Arc::new(FilePolicyStore::new(path)),
        None => {
            warn!("No policy file configured, requests are unlimited without a default quota");
            Arc::new(StaticPolicyStore::default())
        }
    };

    let cache = Arc::new(
        PolicyCache::new(policy_store, config.policies.cache_ttl())
            .with_reload_timeout(config.policies.reload_timeout()),
    );
    cache
        .refresh()
        .await
        .context("Failed to load initial policies")?;

    let default_quota = config
        .admission
        .default_quota
        .map(|q| q.to_quota())
        .transpose()?;
    let resolver = PolicyResolver::new(cache.clone()).with_default_quota(default_quota);

    let metrics = GateMetrics::new();
    let gate = Arc::new(
        AdmissionGate::new(resolver, counter_store.clone())
            .with_settings(GateSettings {
                store_timeout: config.admission.store_timeout(),
                fallback: config.admission.fallback,
            })
            .with_metrics(metrics.clone()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    if config.reaper.enabled {
        let reaper = Reaper::new(
            counter_store.clone(),
            config.reaper.interval(),
            config.reaper.batch_size,
        )
        .with_metrics(metrics.clone());
        tasks.extend(reaper.spawn(shutdown_rx.clone()));
    }

    let mut state = AppState::new(gate);
    let cluster = if config.cluster.enabled {
        let cluster = Arc::new(Cluster::start(config.cluster.to_cluster_config()).await?);
        tasks.push(spawn_invalidation_watch(
            cluster.clone(),
            cache.clone(),
            config.cluster.poll_interval(),
            shutdown_rx.clone(),
        ));
        state = state.with_cluster(cluster.clone());
        Some(cluster)
    } else {
        None
    };

    let server = HttpServer::new(config.server.http_addr, state);
    info!("Starting HTTP server on {}", config.server.http_addr);
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster handle still in use, skipping graceful leave"),
        }
    }

    served?;
    info!("Tollgate admission control service stopped");
    Ok(())
}

fn init_tracing(config: &TollgateConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match config.logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
