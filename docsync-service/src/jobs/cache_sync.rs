//! Cache Sync Background Task
//!
//! Periodically folds every cached document into the durable store using
//! the same merge policy as the reconciliation engine:
//!
//! - Store miss: insert the cached document
//! - Store hit: merge the cached document into the stored one and update
//!
//! A failure on one key is logged and the sweep moves on to the next key.
//! Each key is folded while holding the same per-key lock the engine uses,
//! so a sweep never interleaves with an in-flight `process` for that url.
//!
//! # Configuration
//!
//! ```rust
//! use docsync_service::jobs::CacheSyncConfig;
//! use std::time::Duration;
//!
//! let config = CacheSyncConfig {
//!     interval: Duration::from_secs(60), // Sweep every minute
//!     evict_expired: true,               // Drop expired cache entries first
//! };
//! ```

use crate::constants::DEFAULT_SYNC_INTERVAL_SECS;
use crate::locks::KeyLocks;
use crate::shutdown::ShutdownSignal;
use docsync_core::{DocSyncResult, StorageError};
use docsync_storage::{CacheStore, DocumentKey, DurableStore, DOCUMENT_KEY_PREFIX};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the cache sync background task.
#[derive(Debug, Clone)]
pub struct CacheSyncConfig {
    /// Time between sweeps (default: 60 seconds). The first sweep runs one
    /// interval after start.
    pub interval: Duration,

    /// Whether to evict expired cache entries before each sweep
    /// (default: true)
    pub evict_expired: bool,
}

impl Default for CacheSyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SYNC_INTERVAL_SECS),
            evict_expired: true,
        }
    }
}

impl CacheSyncConfig {
    /// Create a configuration for development/testing with a short interval.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(5),
            evict_expired: true,
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for cache sync activity since startup.
#[derive(Debug, Default)]
pub struct CacheSyncMetrics {
    /// Total sweeps completed
    pub sweeps: AtomicU64,

    /// Documents inserted into the store
    pub inserted: AtomicU64,

    /// Documents whose stored record changed
    pub updated: AtomicU64,

    /// Documents already in agreement with the store
    pub unchanged: AtomicU64,

    /// Per-key failures plus sweeps that could not list the cache
    pub failures: AtomicU64,

    /// Expired cache entries evicted
    pub evicted: AtomicU64,
}

impl CacheSyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&self, report: &SyncReport) {
        self.sweeps.fetch_add(1, Ordering::Relaxed);
        self.inserted.fetch_add(report.inserted, Ordering::Relaxed);
        self.updated.fetch_add(report.updated, Ordering::Relaxed);
        self.unchanged.fetch_add(report.unchanged, Ordering::Relaxed);
        self.failures.fetch_add(report.failed, Ordering::Relaxed);
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> CacheSyncSnapshot {
        CacheSyncSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            inserted: self.inserted.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of cache sync metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheSyncSnapshot {
    pub sweeps: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    pub failures: u64,
    pub evicted: u64,
}

// ============================================================================
// SWEEP
// ============================================================================

/// Result of a single sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Keys listed under the document prefix
    pub keys_seen: u64,
    pub inserted: u64,
    pub updated: u64,
    pub unchanged: u64,
    /// Keys that failed and were skipped
    pub failed: u64,
    /// Keys that were malformed or vanished between listing and reading
    pub skipped: u64,
}

impl SyncReport {
    /// Whether the sweep wrote anything or hit errors.
    pub fn is_eventful(&self) -> bool {
        self.inserted + self.updated + self.failed > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyOutcome {
    Inserted,
    Updated,
    Unchanged,
    Vanished,
}

/// Folds cache contents into the durable store.
pub struct CacheSynchronizer<C: ?Sized, S: ?Sized> {
    cache: Arc<C>,
    store: Arc<S>,
    locks: Arc<KeyLocks>,
}

impl<C, S> CacheSynchronizer<C, S>
where
    C: CacheStore + ?Sized,
    S: DurableStore + ?Sized,
{
    pub fn new(cache: Arc<C>, store: Arc<S>, locks: Arc<KeyLocks>) -> Self {
        Self {
            cache,
            store,
            locks,
        }
    }

    /// Run one sweep over every cached document.
    ///
    /// Fails only if the cache cannot be listed; per-key errors are logged
    /// and counted in the report.
    pub async fn sync(&self) -> DocSyncResult<SyncReport> {
        let keys = self.cache.list_keys(DOCUMENT_KEY_PREFIX).await?;
        let mut report = SyncReport {
            keys_seen: keys.len() as u64,
            ..Default::default()
        };

        for raw in keys {
            let Some(key) = DocumentKey::parse(&raw) else {
                tracing::warn!(key = %raw, "Skipping malformed cache key");
                report.skipped += 1;
                continue;
            };

            match self.sync_key(&key).await {
                Ok(KeyOutcome::Inserted) => report.inserted += 1,
                Ok(KeyOutcome::Updated) => report.updated += 1,
                Ok(KeyOutcome::Unchanged) => report.unchanged += 1,
                Ok(KeyOutcome::Vanished) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(key = %key, error = %e, "Failed to sync cached document");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    async fn sync_key(&self, key: &DocumentKey) -> DocSyncResult<KeyOutcome> {
        let url = key.url();
        let _guard = self.locks.lock(url).await;

        let Some(cached) = self.cache.get(key).await? else {
            return Ok(KeyOutcome::Vanished);
        };
        if cached.url != url {
            return Err(StorageError::Serialization {
                reason: format!("cache entry {} holds document for {}", key, cached.url),
            }
            .into());
        }

        match self.store.get(url).await? {
            None => {
                self.store.insert(&cached).await?;
                tracing::debug!(url = %url, "Inserted cached document into store");
                Ok(KeyOutcome::Inserted)
            }
            Some(stored) => {
                let merged = stored.merge(&cached);
                if merged == stored {
                    return Ok(KeyOutcome::Unchanged);
                }
                self.store.update(&merged).await?;
                tracing::debug!(url = %url, fetch_time = merged.fetch_time, "Updated stored document from cache");
                Ok(KeyOutcome::Updated)
            }
        }
    }

    async fn evict_expired(&self) -> DocSyncResult<u64> {
        self.cache.evict_expired().await
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that sweeps the cache into the store on a fixed interval.
///
/// Runs until the shutdown signal is raised. A sweep in progress is
/// abandoned on shutdown; keys already written stay written.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
///
/// # Example
///
/// ```ignore
/// let (trigger, signal) = shutdown::channel();
/// let synchronizer = Arc::new(CacheSynchronizer::new(cache, store, locks));
///
/// let handle = tokio::spawn(cache_sync_task(synchronizer, CacheSyncConfig::default(), signal));
///
/// // Later, trigger shutdown
/// trigger.trigger();
/// let metrics = handle.await?;
/// ```
pub async fn cache_sync_task<C, S>(
    synchronizer: Arc<CacheSynchronizer<C, S>>,
    config: CacheSyncConfig,
    mut shutdown: ShutdownSignal,
) -> Arc<CacheSyncMetrics>
where
    C: CacheStore + ?Sized,
    S: DurableStore + ?Sized,
{
    let metrics = Arc::new(CacheSyncMetrics::new());

    let mut sync_interval = interval_at(Instant::now() + config.interval, config.interval);
    sync_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_ms = config.interval.as_millis() as u64,
        evict_expired = config.evict_expired,
        "Cache sync task started"
    );

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            _ = sync_interval.tick() => {
                tokio::select! {
                    biased;
                    _ = shutdown.recv() => break,
                    _ = run_sweep(&synchronizer, &config, &metrics) => {}
                }
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        inserted = snapshot.inserted,
        updated = snapshot.updated,
        unchanged = snapshot.unchanged,
        failures = snapshot.failures,
        evicted = snapshot.evicted,
        "Cache sync task completed"
    );

    metrics
}

async fn run_sweep<C, S>(
    synchronizer: &CacheSynchronizer<C, S>,
    config: &CacheSyncConfig,
    metrics: &CacheSyncMetrics,
) where
    C: CacheStore + ?Sized,
    S: DurableStore + ?Sized,
{
    if config.evict_expired {
        match synchronizer.evict_expired().await {
            Ok(0) => {}
            Ok(evicted) => {
                metrics.evicted.fetch_add(evicted, Ordering::Relaxed);
                tracing::debug!(evicted, "Evicted expired cache entries");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to evict expired cache entries"),
        }
    }

    match synchronizer.sync().await {
        Ok(report) => {
            metrics.record(&report);
            if report.is_eventful() {
                tracing::info!(
                    keys_seen = report.keys_seen,
                    inserted = report.inserted,
                    updated = report.updated,
                    unchanged = report.unchanged,
                    failed = report.failed,
                    skipped = report.skipped,
                    "Cache sync sweep completed"
                );
            } else {
                tracing::trace!(keys_seen = report.keys_seen, "Cache sync sweep found nothing to do");
            }
        }
        Err(e) => {
            metrics.failures.fetch_add(1, Ordering::Relaxed);
            tracing::error!(error = %e, "Cache sync sweep failed to list cache keys");
        }
    }
}
