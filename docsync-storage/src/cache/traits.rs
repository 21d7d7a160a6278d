//! Cache backend trait.
//!
//! This module defines the capability a cache must provide so that the
//! reconciliation engine and the cache synchronizer can share it.

use async_trait::async_trait;
use docsync_core::{CacheTtl, DocSyncResult, Document};

use super::document_key::DocumentKey;

/// Cache backend trait for pluggable cache implementations.
///
/// Implementations must be safe to share between the reconcile stage and the
/// synchronizer, which call into them concurrently.
///
/// # Misses
///
/// A missing or expired key is reported as `Ok(None)`. Errors are reserved
/// for backend failures (I/O, corrupt entries, serialization).
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a document from the cache.
    async fn get(&self, key: &DocumentKey) -> DocSyncResult<Option<Document>>;

    /// Write a document under `key` with the given expiry policy.
    async fn set(&self, key: &DocumentKey, doc: &Document, ttl: CacheTtl) -> DocSyncResult<()>;

    /// List every live key starting with `prefix`.
    async fn list_keys(&self, prefix: &str) -> DocSyncResult<Vec<String>>;

    /// Remove expired entries, returning how many were dropped.
    ///
    /// Backends with native expiry have nothing to do here.
    async fn evict_expired(&self) -> DocSyncResult<u64> {
        Ok(0)
    }

    /// Get cache statistics.
    async fn stats(&self) -> DocSyncResult<CacheStats> {
        Ok(CacheStats::default())
    }
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses, including reads of expired entries.
    pub misses: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
    /// Number of entries removed because they expired.
    pub expirations: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}
