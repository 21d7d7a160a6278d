//! docsync Storage - Cache and Durable Store Abstractions
//!
//! Defines the two storage tiers the reconciliation engine works against:
//! a fast, possibly expiring cache and an authoritative durable store.
//! The PostgreSQL store lives in docsync-service.

pub mod cache;

pub use cache::{
    CacheStats, CacheStore, DocumentKey, InMemoryCache, LmdbCacheError, LmdbDocumentCache,
    DOCUMENT_KEY_PREFIX,
};

use async_trait::async_trait;
use docsync_core::{DocSyncError, DocSyncResult, Document, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

// ============================================================================
// DURABLE STORE TRAIT
// ============================================================================

/// Authoritative document storage keyed by url.
///
/// `insert` and `update` are distinct so callers decide between creating and
/// replacing a record. Both persist all five document fields.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Fetch the document with this url.
    async fn get(&self, url: &str) -> DocSyncResult<Option<Document>>;

    /// Create a record. Fails with `StorageError::AlreadyExists` when the url
    /// is already stored.
    async fn insert(&self, doc: &Document) -> DocSyncResult<()>;

    /// Replace an existing record. Fails with `StorageError::NotFound` when
    /// the url is not stored.
    async fn update(&self, doc: &Document) -> DocSyncResult<()>;
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// In-memory durable store for tests and development.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    documents: Arc<RwLock<HashMap<String, Document>>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with documents.
    pub fn with_documents(docs: impl IntoIterator<Item = Document>) -> Self {
        let documents = docs.into_iter().map(|d| (d.url.clone(), d)).collect();
        Self {
            documents: Arc::new(RwLock::new(documents)),
        }
    }

    /// Number of stored documents.
    pub fn len(&self) -> usize {
        self.documents.read().map(|d| d.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every stored document, sorted by url.
    pub fn snapshot(&self) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .documents
            .read()
            .map(|d| d.values().cloned().collect())
            .unwrap_or_default();
        docs.sort_by(|a, b| a.url.cmp(&b.url));
        docs
    }

    /// Clear all stored data.
    pub fn clear(&self) {
        if let Ok(mut documents) = self.documents.write() {
            documents.clear();
        }
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, url: &str) -> DocSyncResult<Option<Document>> {
        let documents = self
            .documents
            .read()
            .map_err(|_| StorageError::LockPoisoned)?;
        Ok(documents.get(url).cloned())
    }

    async fn insert(&self, doc: &Document) -> DocSyncResult<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        if documents.contains_key(&doc.url) {
            return Err(DocSyncError::Storage(StorageError::AlreadyExists {
                url: doc.url.clone(),
            }));
        }
        documents.insert(doc.url.clone(), doc.clone());
        Ok(())
    }

    async fn update(&self, doc: &Document) -> DocSyncResult<()> {
        let mut documents = self
            .documents
            .write()
            .map_err(|_| StorageError::LockPoisoned)?;
        let stored = documents.get_mut(&doc.url).ok_or_else(|| {
            DocSyncError::Storage(StorageError::NotFound {
                url: doc.url.clone(),
            })
        })?;
        *stored = doc.clone();
        Ok(())
    }
}

// ============================================================================
// TESTS
// ============================================================================
