//! LMDB-backed document cache with per-entry expiry.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a memory-mapped
//! key-value store that survives process restarts.
//!
//! # Entry Format
//!
//! ```text
//! [expires_at: i64 LE millis, 0 = never][json document]
//! ```
//!
//! LMDB has no native expiry. Expired entries read as misses, are skipped by
//! `list_keys`, and are physically removed by `evict_expired`.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The backend uses:
//! - Read transactions for `get` and `list_keys`
//! - Write transactions for `set` and `evict_expired`
//! - Statistics are kept behind a lock and never block cache operations

use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use docsync_core::{CacheTtl, DocSyncResult, Document};
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use super::document_key::DocumentKey;
use super::traits::{CacheStats, CacheStore};

/// Size of the expiry header in front of every value.
const HEADER_LEN: usize = 8;

/// Expiry header value meaning "never expires".
const NO_EXPIRY: i64 = 0;

/// Error type for LMDB cache operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbCacheError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbCacheError to DocSyncError.
impl From<LmdbCacheError> for docsync_core::DocSyncError {
    fn from(e: LmdbCacheError) -> Self {
        match e {
            LmdbCacheError::Serialization(reason) | LmdbCacheError::Deserialization(reason) => {
                docsync_core::StorageError::Serialization { reason }.into()
            }
            other => docsync_core::StorageError::backend("lmdb", other).into(),
        }
    }
}

/// LMDB-backed document cache.
///
/// # Example
///
/// ```ignore
/// use docsync_storage::cache::{DocumentKey, LmdbDocumentCache};
///
/// let cache = LmdbDocumentCache::new("/var/lib/docsync/cache", 512)?;
/// let key = DocumentKey::for_url(&doc.url);
/// cache.set(&key, &doc, CacheTtl::Persistent).await?;
/// let cached = cache.get(&key).await?;
/// ```
pub struct LmdbDocumentCache {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Hit/miss/expiry counters.
    stats: Arc<RwLock<CacheStats>>,
}

impl LmdbDocumentCache {
    /// Create a new LMDB document cache.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbCacheError> {
        std::fs::create_dir_all(&path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbCacheError::EnvOpen(e.to_string()))?;

        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbCacheError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            stats: Arc::new(RwLock::new(CacheStats::default())),
        })
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
        }
    }

    fn record_expirations(&self, count: u64) {
        if let Ok(mut stats) = self.stats.write() {
            stats.expirations += count;
        }
    }

    /// Read the expiry header of an existing entry, if any.
    fn existing_expiry(&self, key: &[u8]) -> Result<Option<i64>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, key) {
            Ok(Some(bytes)) => Ok(Some(decode_entry(bytes)?.0)),
            Ok(None) => Ok(None),
            Err(e) => Err(LmdbCacheError::Transaction(e.to_string())),
        }
    }

    /// Iterate over live keys matching a prefix and collect them.
    fn collect_keys_with_prefix(
        &self,
        prefix: &[u8],
        now_millis: i64,
    ) -> Result<Vec<String>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut keys = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            if !key.starts_with(prefix) {
                continue;
            }
            // Unreadable entries are still listed so the caller's own read
            // reports them for that key alone.
            match decode_entry(value) {
                Ok((expires_at, _)) if is_expired(expires_at, now_millis) => continue,
                Ok(_) => {}
                Err(e) => tracing::warn!(key = %String::from_utf8_lossy(key), error = %e, "Listing unreadable cache entry"),
            }
            match std::str::from_utf8(key) {
                Ok(key) => keys.push(key.to_string()),
                Err(_) => tracing::warn!(key_len = key.len(), "Skipping non-UTF-8 cache key"),
            }
        }

        Ok(keys)
    }

    /// Collect keys whose entries have expired.
    fn collect_expired_keys(&self, now_millis: i64) -> Result<Vec<Vec<u8>>, LmdbCacheError> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let iter = self
            .db
            .iter(&rtxn)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut expired = Vec::new();
        for result in iter {
            let (key, value) = result.map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            match decode_entry(value) {
                Ok((expires_at, _)) if is_expired(expires_at, now_millis) => {
                    expired.push(key.to_vec());
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(key = %String::from_utf8_lossy(key), error = %e, "Skipping unreadable cache entry during eviction");
                }
            }
        }

        Ok(expired)
    }
}

#[async_trait]
impl CacheStore for LmdbDocumentCache {
    async fn get(&self, key: &DocumentKey) -> DocSyncResult<Option<Document>> {
        let rtxn = self
            .env
            .read_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        match self.db.get(&rtxn, key.as_bytes()) {
            Ok(Some(bytes)) => {
                let (expires_at, body) = decode_entry(bytes)?;
                if is_expired(expires_at, Utc::now().timestamp_millis()) {
                    self.record_miss();
                    return Ok(None);
                }

                let doc: Document = serde_json::from_slice(body)
                    .map_err(|e| LmdbCacheError::Deserialization(e.to_string()))?;
                self.record_hit();
                Ok(Some(doc))
            }
            Ok(None) => {
                self.record_miss();
                Ok(None)
            }
            Err(e) => {
                self.record_miss();
                Err(LmdbCacheError::Transaction(e.to_string()).into())
            }
        }
    }

    async fn set(&self, key: &DocumentKey, doc: &Document, ttl: CacheTtl) -> DocSyncResult<()> {
        let now_millis = Utc::now().timestamp_millis();
        let expires_at = match ttl {
            CacheTtl::Persistent => NO_EXPIRY,
            CacheTtl::Expire(duration) => expiry_after(now_millis, duration),
            CacheTtl::KeepExisting => match self.existing_expiry(key.as_bytes())? {
                Some(existing) if !is_expired(existing, now_millis) => existing,
                _ => NO_EXPIRY,
            },
        };

        let entry = encode_entry(expires_at, doc)?;

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        self.db
            .put(&mut wtxn, key.as_bytes(), &entry)
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        Ok(())
    }

    async fn list_keys(&self, prefix: &str) -> DocSyncResult<Vec<String>> {
        Ok(self.collect_keys_with_prefix(prefix.as_bytes(), Utc::now().timestamp_millis())?)
    }

    async fn evict_expired(&self) -> DocSyncResult<u64> {
        let expired = self.collect_expired_keys(Utc::now().timestamp_millis())?;
        if expired.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self
            .env
            .write_txn()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        let mut deleted = 0u64;
        for key in &expired {
            if self
                .db
                .delete(&mut wtxn, key)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
            {
                deleted += 1;
            }
        }

        wtxn.commit()
            .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;

        self.record_expirations(deleted);
        Ok(deleted)
    }

    async fn stats(&self) -> DocSyncResult<CacheStats> {
        let entry_count = {
            let rtxn = self
                .env
                .read_txn()
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?;
            self.db
                .len(&rtxn)
                .map_err(|e| LmdbCacheError::Transaction(e.to_string()))?
        };

        let mut stats = self
            .stats
            .read()
            .map(|s| s.clone())
            .unwrap_or_default();
        stats.entry_count = entry_count;
        Ok(stats)
    }
}

fn expiry_after(now_millis: i64, ttl: Duration) -> i64 {
    let ttl_millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
    // A zero-length TTL still has to expire, and 0 is reserved for "never".
    now_millis.saturating_add(ttl_millis).max(1)
}

fn is_expired(expires_at: i64, now_millis: i64) -> bool {
    expires_at != NO_EXPIRY && expires_at <= now_millis
}

fn encode_entry(expires_at: i64, doc: &Document) -> Result<Vec<u8>, LmdbCacheError> {
    let body =
        serde_json::to_vec(doc).map_err(|e| LmdbCacheError::Serialization(e.to_string()))?;

    let mut entry = Vec::with_capacity(HEADER_LEN + body.len());
    entry.extend_from_slice(&expires_at.to_le_bytes());
    entry.extend_from_slice(&body);
    Ok(entry)
}

fn decode_entry(bytes: &[u8]) -> Result<(i64, &[u8]), LmdbCacheError> {
    if bytes.len() < HEADER_LEN {
        return Err(LmdbCacheError::Deserialization(format!(
            "entry too short: {} bytes",
            bytes.len()
        )));
    }
    let header: [u8; HEADER_LEN] = bytes[0..HEADER_LEN]
        .try_into()
        .map_err(|_| LmdbCacheError::Deserialization("Invalid expiry header".into()))?;
    Ok((i64::from_le_bytes(header), &bytes[HEADER_LEN..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DOCUMENT_KEY_PREFIX;
    use docsync_core::{DocSyncError, StorageError};
    use tempfile::TempDir;

    fn create_test_cache() -> (LmdbDocumentCache, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let cache =
            LmdbDocumentCache::new(temp_dir.path(), 10).expect("cache creation should succeed");
        (cache, temp_dir)
    }

    fn make_doc(url: &str, text: &str, fetch_time: u64) -> Document {
        Document::new(url, text, fetch_time, 0)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (cache, _temp_dir) = create_test_cache();
        let doc = make_doc("https://example.com/a", "body", 100);
        let key = DocumentKey::for_url(&doc.url);

        cache
            .set(&key, &doc, CacheTtl::Persistent)
            .await
            .expect("set should succeed");

        let cached = cache.get(&key).await.expect("get should succeed");
        assert_eq!(cached, Some(doc));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (cache, _temp_dir) = create_test_cache();
        let cached = cache
            .get(&DocumentKey::for_url("https://example.com/missing"))
            .await
            .expect("get should succeed");
        assert!(cached.is_none());
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (cache, _temp_dir) = create_test_cache();
        let key = DocumentKey::for_url("https://example.com/a");

        cache
            .set(&key, &make_doc("https://example.com/a", "v1", 1), CacheTtl::Persistent)
            .await
            .expect("set should succeed");
        cache
            .set(&key, &make_doc("https://example.com/a", "v2", 2), CacheTtl::Persistent)
            .await
            .expect("set should succeed");

        let cached = cache.get(&key).await.expect("get should succeed");
        assert_eq!(cached.expect("cached should be Some").text, "v2");
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_miss() {
        let (cache, _temp_dir) = create_test_cache();
        let doc = make_doc("https://example.com/ttl", "short-lived", 1);
        let key = DocumentKey::for_url(&doc.url);

        cache
            .set(&key, &doc, CacheTtl::Expire(Duration::from_millis(5)))
            .await
            .expect("set should succeed");
        std::thread::sleep(Duration::from_millis(30));

        assert!(cache.get(&key).await.expect("get should succeed").is_none());
        assert!(cache
            .list_keys("doc:")
            .await
            .expect("list should succeed")
            .is_empty());
    }

    #[tokio::test]
    async fn test_evict_expired_removes_only_expired() {
        let (cache, _temp_dir) = create_test_cache();
        let keep = make_doc("https://example.com/keep", "k", 1);
        let drop = make_doc("https://example.com/drop", "d", 1);

        cache
            .set(&DocumentKey::for_url(&keep.url), &keep, CacheTtl::Persistent)
            .await
            .expect("set should succeed");
        cache
            .set(
                &DocumentKey::for_url(&drop.url),
                &drop,
                CacheTtl::Expire(Duration::from_millis(5)),
            )
            .await
            .expect("set should succeed");
        std::thread::sleep(Duration::from_millis(30));

        let evicted = cache.evict_expired().await.expect("evict should succeed");
        assert_eq!(evicted, 1);

        let stats = cache.stats().await.expect("stats should succeed");
        assert_eq!(stats.entry_count, 1);
        assert_eq!(stats.expirations, 1);
    }

    #[tokio::test]
    async fn test_keep_existing_preserves_expiry() {
        let (cache, _temp_dir) = create_test_cache();
        let key = DocumentKey::for_url("https://example.com/keep-ttl");

        cache
            .set(
                &key,
                &make_doc("https://example.com/keep-ttl", "v1", 1),
                CacheTtl::Expire(Duration::from_millis(20)),
            )
            .await
            .expect("set should succeed");
        cache
            .set(
                &key,
                &make_doc("https://example.com/keep-ttl", "v2", 2),
                CacheTtl::KeepExisting,
            )
            .await
            .expect("set should succeed");

        std::thread::sleep(Duration::from_millis(50));
        assert!(cache.get(&key).await.expect("get should succeed").is_none());
    }

    #[tokio::test]
    async fn test_keep_existing_on_new_key_never_expires() {
        let (cache, _temp_dir) = create_test_cache();
        let key = DocumentKey::for_url("https://example.com/fresh");
        let doc = make_doc("https://example.com/fresh", "v1", 1);

        cache
            .set(&key, &doc, CacheTtl::KeepExisting)
            .await
            .expect("set should succeed");

        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(cache.get(&key).await.expect("get should succeed"), Some(doc));
    }

    #[tokio::test]
    async fn test_list_keys_filters_by_prefix() {
        let (cache, _temp_dir) = create_test_cache();
        for url in ["https://a.com", "https://b.com", "https://c.com"] {
            cache
                .set(&DocumentKey::for_url(url), &make_doc(url, "x", 1), CacheTtl::Persistent)
                .await
                .expect("set should succeed");
        }

        let mut keys = cache.list_keys("doc:").await.expect("list should succeed");
        keys.sort();
        assert_eq!(
            keys,
            vec!["doc:https://a.com", "doc:https://b.com", "doc:https://c.com"]
        );

        let only_b = cache
            .list_keys("doc:https://b")
            .await
            .expect("list should succeed");
        assert_eq!(only_b, vec!["doc:https://b.com"]);
    }

    #[tokio::test]
    async fn test_stats() {
        let (cache, _temp_dir) = create_test_cache();
        let doc = make_doc("https://example.com/stats", "s", 1);
        let key = DocumentKey::for_url(&doc.url);

        let _ = cache.get(&key).await;
        cache
            .set(&key, &doc, CacheTtl::Persistent)
            .await
            .expect("set should succeed");
        let _ = cache.get(&key).await;
        let _ = cache.get(&key).await;

        let stats = cache.stats().await.expect("stats should succeed");
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let doc = make_doc("https://example.com/durable", "persisted", 9);
        let key = DocumentKey::for_url(&doc.url);

        {
            let cache = LmdbDocumentCache::new(temp_dir.path(), 10).expect("open should succeed");
            cache
                .set(&key, &doc, CacheTtl::Persistent)
                .await
                .expect("set should succeed");
        }

        let reopened = LmdbDocumentCache::new(temp_dir.path(), 10).expect("reopen should succeed");
        assert_eq!(reopened.get(&key).await.expect("get should succeed"), Some(doc));
    }

    #[test]
    fn test_decode_entry_rejects_short_values() {
        let err: DocSyncError = decode_entry(&[1, 2, 3]).unwrap_err().into();
        assert!(matches!(err, DocSyncError::Storage(StorageError::Serialization { .. })));
    }

    #[test]
    fn test_zero_ttl_still_expires() {
        assert!(expiry_after(0, Duration::ZERO) > NO_EXPIRY);
        assert!(is_expired(expiry_after(1_000, Duration::ZERO), 1_000));
    }

    fn put_raw(cache: &LmdbDocumentCache, key: &str, value: &[u8]) {
        let mut wtxn = cache.env.write_txn().expect("write txn should open");
        cache
            .db
            .put(&mut wtxn, key.as_bytes(), value)
            .expect("raw put should succeed");
        wtxn.commit().expect("commit should succeed");
    }

    #[tokio::test]
    async fn test_unreadable_entry_does_not_poison_scans() {
        let (cache, _temp_dir) = create_test_cache();
        let good = make_doc("https://example.com/good", "body", 1);
        let stale = make_doc("https://example.com/stale", "old", 1);
        let bad_key = DocumentKey::for_url("https://example.com/bad");

        cache
            .set(&DocumentKey::for_url(&good.url), &good, CacheTtl::Persistent)
            .await
            .expect("set should succeed");
        cache
            .set(
                &DocumentKey::for_url(&stale.url),
                &stale,
                CacheTtl::Expire(Duration::from_millis(1)),
            )
            .await
            .expect("set should succeed");
        put_raw(&cache, bad_key.as_str(), &[0xAB, 0xCD]);
        std::thread::sleep(Duration::from_millis(10));

        let mut keys = cache.list_keys(DOCUMENT_KEY_PREFIX).await.expect("list should succeed");
        keys.sort();
        assert_eq!(
            keys,
            vec![bad_key.as_str().to_string(), DocumentKey::for_url(&good.url).as_str().to_string()]
        );

        // The bad key fails on its own read only.
        assert!(cache.get(&bad_key).await.is_err());

        let evicted = cache.evict_expired().await.expect("eviction should succeed");
        assert_eq!(evicted, 1);
        assert_eq!(
            cache.get(&DocumentKey::for_url(&good.url)).await.expect("get should succeed"),
            Some(good)
        );
    }
}
