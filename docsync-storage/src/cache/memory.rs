//! In-process document cache.
//!
//! Used by tests and by deployments that run without a cache directory.
//! Expiry is evaluated against a monotonic clock on every read.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use docsync_core::{CacheTtl, DocSyncResult, Document, StorageError};

use super::document_key::DocumentKey;
use super::traits::{CacheStats, CacheStore};

#[derive(Debug, Clone)]
struct CachedDocument {
    doc: Document,
    expires_at: Option<Instant>,
}

impl CachedDocument {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory cache implementation backed by a `HashMap`.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCache {
    entries: Arc<RwLock<HashMap<String, CachedDocument>>>,
    stats: Arc<RwLock<CacheStats>>,
}

impl InMemoryCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a raw entry under an arbitrary key, bypassing the document
    /// key type. Lets tests plant keys the synchronizer must skip.
    pub fn insert_raw(&self, key: &str, doc: Document) -> DocSyncResult<()> {
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        entries.insert(
            key.to_string(),
            CachedDocument {
                doc,
                expires_at: None,
            },
        );
        Ok(())
    }

    fn bump(&self, hit: bool) {
        if let Ok(mut stats) = self.stats.write() {
            if hit {
                stats.hits += 1;
            } else {
                stats.misses += 1;
            }
        }
    }
}

#[async_trait]
impl CacheStore for InMemoryCache {
    async fn get(&self, key: &DocumentKey) -> DocSyncResult<Option<Document>> {
        let found = {
            let entries = self
                .entries
                .read()
                .map_err(|_| StorageError::LockPoisoned)?;
            entries
                .get(key.as_str())
                .filter(|entry| !entry.is_expired(Instant::now()))
                .map(|entry| entry.doc.clone())
        };
        self.bump(found.is_some());
        Ok(found)
    }

    async fn set(&self, key: &DocumentKey, doc: &Document, ttl: CacheTtl) -> DocSyncResult<()> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;

        let expires_at = match ttl {
            CacheTtl::Persistent => None,
            // A deadline past the clock's range never arrives.
            CacheTtl::Expire(ttl) => now.checked_add(ttl),
            CacheTtl::KeepExisting => entries
                .get(key.as_str())
                .filter(|entry| !entry.is_expired(now))
                .and_then(|entry| entry.expires_at),
        };

        entries.insert(
            key.as_str().to_string(),
            CachedDocument {
                doc: doc.clone(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> DocSyncResult<Vec<String>> {
        let now = Instant::now();
        let entries = self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn evict_expired(&self) -> DocSyncResult<u64> {
        let now = Instant::now();
        let mut entries = self
            .entries
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        let evicted = (before - entries.len()) as u64;

        if let Ok(mut stats) = self.stats.write() {
            stats.expirations += evicted;
        }
        Ok(evicted)
    }

    async fn stats(&self) -> DocSyncResult<CacheStats> {
        let entry_count = self
            .entries
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .len() as u64;
        let mut stats = self
            .stats
            .read()
            .map_err(|_| StorageError::LockPoisoned)?
            .clone();
        stats.entry_count = entry_count;
        Ok(stats)
    }
}
