//! docsync Entry Point
//!
//! Loads configuration, connects the cache, PostgreSQL and Redis, and runs
//! the pipeline until SIGINT or SIGTERM.

use std::sync::Arc;

use docsync_core::DocSyncResult;
use docsync_service::shutdown::{self, ShutdownTrigger};
use docsync_service::{
    init_tracing, CacheBackendKind, CacheSynchronizer, EventBus, KeyLocks, PgDocumentStore,
    Pipeline, RedisStreamBus, ReconciliationEngine, ServiceConfig,
};
use docsync_storage::{CacheStore, InMemoryCache, LmdbDocumentCache};

use docsync_service::constants::DEFAULT_KEY_LOCK_SHARDS;

#[tokio::main]
async fn main() -> DocSyncResult<()> {
    let config = ServiceConfig::load()?;
    init_tracing(&config.telemetry)?;

    let cache = open_cache(&config)?;
    let store = Arc::new(PgDocumentStore::from_config(&config.db)?);
    store.ensure_schema().await?;

    let bus = RedisStreamBus::connect(&config.bus).await?;
    let (consumer, producer) = bus.split();

    let locks = Arc::new(KeyLocks::new(DEFAULT_KEY_LOCK_SHARDS));
    let engine = ReconciliationEngine::new(
        Arc::clone(&cache),
        Arc::clone(&store),
        Arc::clone(&locks),
        config.cache.ttl_policy(),
    );
    let synchronizer = CacheSynchronizer::new(cache, store, locks);

    let pipeline = Pipeline::new(Arc::new(engine), config.pipeline.clone())
        .with_synchronizer(Arc::new(synchronizer), config.sync.job_config());

    let (trigger, external) = shutdown::channel();
    tokio::spawn(wait_for_signal(trigger));

    tracing::info!("Starting docsync pipeline");
    let report = pipeline.run(consumer, producer, external).await?;
    tracing::info!(
        produced = report.pipeline.produced,
        sync_sweeps = report.sync.map(|s| s.sweeps).unwrap_or(0),
        "docsync stopped"
    );
    Ok(())
}

fn open_cache(config: &ServiceConfig) -> DocSyncResult<Arc<dyn CacheStore>> {
    match config.cache.backend {
        CacheBackendKind::Lmdb => {
            let cache = LmdbDocumentCache::new(&config.cache.path, config.cache.max_size_mb)?;
            tracing::info!(path = %config.cache.path.display(), "Opened LMDB cache");
            Ok(Arc::new(cache))
        }
        CacheBackendKind::Memory => {
            tracing::info!("Using in-memory cache");
            Ok(Arc::new(InMemoryCache::new()))
        }
    }
}

async fn wait_for_signal(trigger: ShutdownTrigger) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    interrupted = tokio::signal::ctrl_c() => log_ctrl_c_failure(interrupted),
                    _ = terminate.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                log_ctrl_c_failure(tokio::signal::ctrl_c().await);
            }
        }
    }
    #[cfg(not(unix))]
    {
        log_ctrl_c_failure(tokio::signal::ctrl_c().await);
    }

    tracing::info!("Shutdown signal received");
    trigger.trigger();
}

/// A ctrl-c listener that cannot be installed still shuts the service down.
fn log_ctrl_c_failure(result: std::io::Result<()>) {
    if let Err(e) = result {
        tracing::error!(error = %e, "Failed to listen for ctrl-c, shutting down");
    }
}
