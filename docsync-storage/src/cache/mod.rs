//! Document cache layer.
//!
//! The cache is the first tier of reconciliation: recent document states are
//! read and written here on every event, and the synchronizer later sweeps
//! them into the durable store.
//!
//! # Keys
//!
//! [`DocumentKey`] is the only way to address a cached document. It always
//! carries the `doc:` prefix, so the reconcile path and the synchronizer's
//! prefix scan agree on the key format.
//!
//! # Expiry
//!
//! Writes take a [`CacheTtl`](docsync_core::CacheTtl). Expired entries read
//! as misses on every backend.

pub mod document_key;
pub mod lmdb_backend;
pub mod memory;
pub mod traits;

pub use document_key::{DocumentKey, DOCUMENT_KEY_PREFIX};
pub use lmdb_backend::{LmdbCacheError, LmdbDocumentCache};
pub use memory::InMemoryCache;
pub use traits::{CacheStats, CacheStore};
