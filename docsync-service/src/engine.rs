//! Reconciliation Engine
//!
//! Per-event entry point. Looks the incoming document up in the cache,
//! falls back to the durable store on a miss, applies the merge policy and
//! writes the result back:
//!
//! ```text
//! cache hit           -> merge, write cache
//! cache miss, stored  -> merge, update store, write cache
//! cache miss, unknown -> insert store, write cache, return incoming as-is
//! ```
//!
//! Any backend error aborts the call. Nothing written before the failure
//! is rolled back, so callers must not assume the two tiers agree after an
//! error.

use std::sync::Arc;

use docsync_core::{CacheTtl, DocSyncResult, Document, MergeOutcome};
use docsync_storage::{CacheStore, DocumentKey, DurableStore};
use serde::{Deserialize, Serialize};

use crate::locks::KeyLocks;

// ============================================================================
// TTL POLICY
// ============================================================================

/// What happens to a cached entry's expiry when a hit is written back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshPolicy {
    /// Restart the configured TTL on every write.
    #[default]
    Reset,
    /// Keep the deadline set when the entry was first cached.
    Preserve,
}

/// Expiry applied to cache writes made by the engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TtlPolicy {
    /// TTL for fresh entries.
    pub ttl: CacheTtl,
    /// Handling of existing entries.
    pub refresh: RefreshPolicy,
}

impl TtlPolicy {
    pub fn new(ttl: CacheTtl, refresh: RefreshPolicy) -> Self {
        Self { ttl, refresh }
    }

    /// TTL for an entry the engine is creating.
    pub fn on_insert(&self) -> CacheTtl {
        self.ttl
    }

    /// TTL for an entry that was just read from the cache.
    pub fn on_refresh(&self) -> CacheTtl {
        match self.refresh {
            RefreshPolicy::Reset => self.ttl,
            RefreshPolicy::Preserve => CacheTtl::KeepExisting,
        }
    }
}

// ============================================================================
// RESULT TYPES
// ============================================================================

/// Where the existing state of a document was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupSource {
    Cache,
    Store,
    /// Neither tier knew the url; the incoming document became the record.
    New,
}

impl LookupSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LookupSource::Cache => "cache",
            LookupSource::Store => "store",
            LookupSource::New => "new",
        }
    }
}

/// Outcome of reconciling one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciled {
    /// The canonical document after the merge.
    pub document: Document,
    pub source: LookupSource,
    /// `None` for new documents, which are not merged.
    pub outcome: Option<MergeOutcome>,
}

// ============================================================================
// ENGINE
// ============================================================================

/// Applies the merge policy against cache-then-store lookups.
///
/// Collaborators are injected; the same cache, store and lock table are
/// shared with the cache synchronizer.
pub struct ReconciliationEngine<C: ?Sized, S: ?Sized> {
    cache: Arc<C>,
    store: Arc<S>,
    locks: Arc<KeyLocks>,
    ttl: TtlPolicy,
}

impl<C, S> ReconciliationEngine<C, S>
where
    C: CacheStore + ?Sized,
    S: DurableStore + ?Sized,
{
    pub fn new(cache: Arc<C>, store: Arc<S>, locks: Arc<KeyLocks>, ttl: TtlPolicy) -> Self {
        Self {
            cache,
            store,
            locks,
            ttl,
        }
    }

    pub fn ttl_policy(&self) -> TtlPolicy {
        self.ttl
    }

    /// Reconcile `incoming` and return the canonical document.
    pub async fn process(&self, incoming: Document) -> DocSyncResult<Document> {
        self.reconcile(&incoming).await.map(|r| r.document)
    }

    /// Reconcile `incoming`, reporting which path was taken.
    pub async fn reconcile(&self, incoming: &Document) -> DocSyncResult<Reconciled> {
        incoming.validate()?;

        let key = DocumentKey::for_url(&incoming.url);
        let _guard = self.locks.lock(&incoming.url).await;

        if let Some(mut cached) = self.cache.get(&key).await? {
            let outcome = cached.merge_from(incoming);
            log_merge(&cached, incoming, outcome, LookupSource::Cache);
            self.cache.set(&key, &cached, self.ttl.on_refresh()).await?;
            return Ok(Reconciled {
                document: cached,
                source: LookupSource::Cache,
                outcome: Some(outcome),
            });
        }

        match self.store.get(&incoming.url).await? {
            Some(mut stored) => {
                let outcome = stored.merge_from(incoming);
                log_merge(&stored, incoming, outcome, LookupSource::Store);
                self.store.update(&stored).await?;
                self.cache.set(&key, &stored, self.ttl.on_insert()).await?;
                Ok(Reconciled {
                    document: stored,
                    source: LookupSource::Store,
                    outcome: Some(outcome),
                })
            }
            None => {
                self.store.insert(incoming).await?;
                self.cache.set(&key, incoming, self.ttl.on_insert()).await?;
                tracing::debug!(url = %incoming.url, fetch_time = incoming.fetch_time, "New document recorded");
                Ok(Reconciled {
                    document: incoming.clone(),
                    source: LookupSource::New,
                    outcome: None,
                })
            }
        }
    }
}

fn log_merge(merged: &Document, incoming: &Document, outcome: MergeOutcome, source: LookupSource) {
    if outcome == MergeOutcome::Unchanged && merged.text != incoming.text {
        tracing::debug!(
            url = %incoming.url,
            fetch_time = incoming.fetch_time,
            "Equal fetch time with differing text; keeping existing text"
        );
    }
    tracing::debug!(
        url = %incoming.url,
        source = source.as_str(),
        outcome = outcome.as_str(),
        fetch_time = merged.fetch_time,
        first_fetch_time = merged.first_fetch_time,
        "Document reconciled"
    );
}
