//! Per-key mutual exclusion for document reconciliation.
//!
//! Every read-merge-write cycle on a url (in the reconcile stage or in the
//! cache sync sweep) runs while holding that url's shard lock. Distinct urls
//! may share a shard; that only costs throughput.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

use crate::constants::DEFAULT_KEY_LOCK_SHARDS;

/// Fixed-size table of async mutexes indexed by url hash.
#[derive(Debug)]
pub struct KeyLocks {
    shards: Vec<Mutex<()>>,
}

impl KeyLocks {
    /// Create a table with `shards` locks (at least one).
    pub fn new(shards: usize) -> Self {
        let shards = (0..shards.max(1)).map(|_| Mutex::new(())).collect();
        Self { shards }
    }

    /// Wait for exclusive access to `url`.
    pub async fn lock(&self, url: &str) -> MutexGuard<'_, ()> {
        self.shards[self.shard_index(url)].lock().await
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, url: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        url.hash(&mut hasher);
        (hasher.finish() % self.shards.len() as u64) as usize
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_LOCK_SHARDS)
    }
}
