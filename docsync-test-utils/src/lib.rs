//! docsync Test Utilities
//!
//! Shared test infrastructure for the docsync workspace:
//! - Fault-injecting cache and store wrappers
//! - Proptest generators for documents
//! - Fixtures for the reconciliation scenarios
//! - Assertions over `DocSyncResult`

// Re-export in-memory collaborators from their source crate
pub use docsync_storage::{InMemoryCache, InMemoryStore};

pub use docsync_core::{CacheTtl, DocSyncError, DocSyncResult, Document, StorageError};

use async_trait::async_trait;
use docsync_storage::{CacheStats, CacheStore, DocumentKey, DurableStore};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Backend name carried by injected failures.
pub const FLAKY_BACKEND: &str = "flaky";

fn injected(op: &str, target: &str) -> DocSyncError {
    StorageError::backend(FLAKY_BACKEND, format!("injected {} failure for {}", op, target)).into()
}

/// Matches every url when registered as a fault target.
pub const ANY_URL: &str = "*";

#[derive(Debug)]
struct FaultSet<Op> {
    faults: Mutex<HashSet<(Op, String)>>,
}

impl<Op: Copy + Eq + std::hash::Hash> FaultSet<Op> {
    fn new() -> Self {
        Self {
            faults: Mutex::new(HashSet::new()),
        }
    }

    fn insert(&self, op: Op, url: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert((op, url.to_string()));
        }
    }

    fn remove(&self, op: Op, url: &str) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.remove(&(op, url.to_string()));
        }
    }

    fn clear(&self) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.clear();
        }
    }

    fn hits(&self, op: Op, url: &str) -> bool {
        self.faults
            .lock()
            .map(|f| f.contains(&(op, url.to_string())) || f.contains(&(op, ANY_URL.to_string())))
            .unwrap_or(false)
    }
}

// ============================================================================
// FLAKY CACHE
// ============================================================================

/// Cache operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheOp {
    Get,
    Set,
    List,
}

/// Wraps a cache and fails selected operations for selected urls.
///
/// `List` faults ignore the url.
#[derive(Debug, Clone)]
pub struct FlakyCache<C> {
    inner: C,
    faults: Arc<FaultSet<CacheOp>>,
}

impl<C> FlakyCache<C> {
    pub fn new(inner: C) -> Self {
        Self {
            inner,
            faults: Arc::new(FaultSet::new()),
        }
    }

    /// Fail `op` for `url` (or every url with [`ANY_URL`]).
    pub fn fail(&self, op: CacheOp, url: &str) {
        self.faults.insert(op, url);
    }

    pub fn heal(&self, op: CacheOp, url: &str) {
        self.faults.remove(op, url);
    }

    pub fn heal_all(&self) {
        self.faults.clear();
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: CacheStore> CacheStore for FlakyCache<C> {
    async fn get(&self, key: &DocumentKey) -> DocSyncResult<Option<Document>> {
        if self.faults.hits(CacheOp::Get, key.url()) {
            return Err(injected("cache get", key.url()));
        }
        self.inner.get(key).await
    }

    async fn set(&self, key: &DocumentKey, doc: &Document, ttl: CacheTtl) -> DocSyncResult<()> {
        if self.faults.hits(CacheOp::Set, key.url()) {
            return Err(injected("cache set", key.url()));
        }
        self.inner.set(key, doc, ttl).await
    }

    async fn list_keys(&self, prefix: &str) -> DocSyncResult<Vec<String>> {
        if self.faults.hits(CacheOp::List, ANY_URL) {
            return Err(injected("cache list", prefix));
        }
        self.inner.list_keys(prefix).await
    }

    async fn evict_expired(&self) -> DocSyncResult<u64> {
        self.inner.evict_expired().await
    }

    async fn stats(&self) -> DocSyncResult<CacheStats> {
        self.inner.stats().await
    }
}

// ============================================================================
// FLAKY STORE
// ============================================================================

/// Durable store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Get,
    Insert,
    Update,
}

/// Wraps a durable store and fails selected operations for selected urls.
#[derive(Debug, Clone)]
pub struct FlakyStore<S> {
    inner: S,
    faults: Arc<FaultSet<StoreOp>>,
}

impl<S> FlakyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(FaultSet::new()),
        }
    }

    /// Fail `op` for `url` (or every url with [`ANY_URL`]).
    pub fn fail(&self, op: StoreOp, url: &str) {
        self.faults.insert(op, url);
    }

    pub fn heal(&self, op: StoreOp, url: &str) {
        self.faults.remove(op, url);
    }

    pub fn heal_all(&self) {
        self.faults.clear();
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: DurableStore> DurableStore for FlakyStore<S> {
    async fn get(&self, url: &str) -> DocSyncResult<Option<Document>> {
        if self.faults.hits(StoreOp::Get, url) {
            return Err(injected("store get", url));
        }
        self.inner.get(url).await
    }

    async fn insert(&self, doc: &Document) -> DocSyncResult<()> {
        if self.faults.hits(StoreOp::Insert, &doc.url) {
            return Err(injected("store insert", &doc.url));
        }
        self.inner.insert(doc).await
    }

    async fn update(&self, doc: &Document) -> DocSyncResult<()> {
        if self.faults.hits(StoreOp::Update, &doc.url) {
            return Err(injected("store update", &doc.url));
        }
        self.inner.update(doc).await
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating documents.

    use super::*;
    use proptest::prelude::*;

    /// Generate a plausible document url.
    pub fn arb_url() -> impl Strategy<Value = String> {
        "[a-z]{1,12}\\.(com|org|net)/[a-z0-9/_-]{0,24}".prop_map(|path| format!("https://{}", path))
    }

    /// Generate a timestamp, biased towards small values so collisions
    /// (equal fetch times) actually occur.
    pub fn arb_fetch_time() -> impl Strategy<Value = u64> {
        prop_oneof![
            4 => 0u64..64,
            1 => any::<u64>(),
        ]
    }

    /// Generate document text.
    pub fn arb_text() -> impl Strategy<Value = String> {
        ".{0,64}"
    }

    /// Generate a document for a given url.
    pub fn arb_document_for(url: String) -> impl Strategy<Value = Document> {
        (arb_text(), arb_fetch_time(), arb_fetch_time(), arb_fetch_time()).prop_map(
            move |(text, fetch_time, pub_date, first_fetch_time)| Document {
                url: url.clone(),
                pub_date,
                fetch_time,
                text,
                first_fetch_time,
            },
        )
    }

    /// Generate a document with an arbitrary url.
    pub fn arb_document() -> impl Strategy<Value = Document> {
        arb_url().prop_flat_map(arb_document_for)
    }

    /// Generate two documents sharing a url.
    pub fn arb_same_url_pair() -> impl Strategy<Value = (Document, Document)> {
        arb_url().prop_flat_map(|url| (arb_document_for(url.clone()), arb_document_for(url)))
    }

    /// Generate a start state and `n` events for the same url.
    pub fn arb_event_history(
        n: std::ops::Range<usize>,
    ) -> impl Strategy<Value = (Document, Vec<Document>)> {
        arb_url().prop_flat_map(move |url| {
            (
                arb_document_for(url.clone()),
                prop::collection::vec(arb_document_for(url), n.clone()),
            )
        })
    }
}

// ============================================================================
// FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built documents for the reconciliation scenarios.

    use super::*;

    pub const SCENARIO_URL: &str = "x";

    /// Publish date used by the backfill scenario (2020-01-01T00:00:00Z).
    pub const BACKFILL_PUB_DATE: u64 = 1_577_836_800;

    /// A document whose first fetch is this fetch.
    pub fn doc(url: &str, text: &str, fetch_time: u64, pub_date: u64) -> Document {
        Document::new(url, text, fetch_time, pub_date)
    }

    /// Newer content replaces text and fetch time. Returns
    /// `(existing, incoming, expected)`.
    pub fn scenario_a() -> (Document, Document, Document) {
        let existing = doc(SCENARIO_URL, "old", 100, 0);
        let incoming = doc(SCENARIO_URL, "new", 200, 0);
        let expected = doc(SCENARIO_URL, "new", 200, 0).with_first_fetch_time(100);
        (existing, incoming, expected)
    }

    /// Older content backfills publish date and first fetch time. Returns
    /// `(existing, incoming, expected)`.
    pub fn scenario_b() -> (Document, Document, Document) {
        let existing = doc(SCENARIO_URL, "new", 200, 0);
        let incoming = doc(SCENARIO_URL, "ignored", 50, BACKFILL_PUB_DATE);
        let expected = doc(SCENARIO_URL, "new", 200, BACKFILL_PUB_DATE).with_first_fetch_time(50);
        (existing, incoming, expected)
    }

    /// Equal fetch time with different text. Returns `(existing, incoming)`;
    /// the expected result is `existing`.
    pub fn scenario_c() -> (Document, Document) {
        let existing = doc(SCENARIO_URL, "kept", 100, 7);
        let incoming = doc(SCENARIO_URL, "dropped", 100, 9);
        (existing, incoming)
    }

    /// A document no backend has seen.
    pub fn scenario_d_incoming() -> Document {
        doc("https://example.com/never-seen", "first", 300, 250)
    }

    /// `count` events for one url with fetch times `1..=count`, text
    /// `"v{fetch_time}"`.
    pub fn numbered_events(url: &str, count: u64) -> Vec<Document> {
        (1..=count)
            .map(|t| doc(url, &format!("v{}", t), t, t * 10))
            .collect()
    }
}

// ============================================================================
// ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over docsync results.

    use super::*;

    /// Assert that a result is a backend storage error.
    #[track_caller]
    pub fn assert_backend_error<T: std::fmt::Debug>(result: &DocSyncResult<T>) {
        match result {
            Err(DocSyncError::Storage(StorageError::Backend { .. })) => {}
            other => panic!("Expected storage backend error, got: {:?}", other),
        }
    }

    /// Assert that a result is an injected fault.
    #[track_caller]
    pub fn assert_injected<T: std::fmt::Debug>(result: &DocSyncResult<T>) {
        match result {
            Err(DocSyncError::Storage(StorageError::Backend { backend, .. }))
                if backend == FLAKY_BACKEND => {}
            other => panic!("Expected injected failure, got: {:?}", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_flaky_cache_fails_only_selected_url() {
        let cache = FlakyCache::new(InMemoryCache::new());
        cache.fail(CacheOp::Get, "bad");

        assertions::assert_injected(&cache.get(&DocumentKey::for_url("bad")).await);
        assert!(cache.get(&DocumentKey::for_url("good")).await.unwrap().is_none());

        cache.heal(CacheOp::Get, "bad");
        assert!(cache.get(&DocumentKey::for_url("bad")).await.is_ok());
    }

    #[tokio::test]
    async fn test_flaky_store_any_url() {
        let store = FlakyStore::new(InMemoryStore::new());
        store.fail(StoreOp::Insert, ANY_URL);

        let result = store.insert(&fixtures::scenario_d_incoming()).await;
        assertions::assert_backend_error(&result);
        assert!(store.inner().is_empty());

        store.heal_all();
        assert!(store.insert(&fixtures::scenario_d_incoming()).await.is_ok());
    }

    #[test]
    fn test_scenario_fixtures_share_url() {
        let (a, b, c) = fixtures::scenario_a();
        assert!(a.url == b.url && b.url == c.url);
        assert_eq!(fixtures::numbered_events("u", 3).len(), 3);
    }

    proptest! {
        #[test]
        fn prop_same_url_pair_shares_url((a, b) in generators::arb_same_url_pair()) {
            prop_assert_eq!(a.url, b.url);
        }

        #[test]
        fn prop_generated_documents_validate(doc in generators::arb_document()) {
            prop_assert!(doc.validate().is_ok());
        }
    }
}
