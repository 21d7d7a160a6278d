//! Background Jobs for the docsync service
//!
//! - `cache_sync`: Sweeps cached documents into the durable store
//!
//! # Usage
//!
//! The pipeline orchestrator spawns the sync task alongside its stages and
//! joins it on shutdown:
//!
//! ```ignore
//! use docsync_service::jobs::{cache_sync_task, CacheSyncConfig, CacheSynchronizer};
//!
//! let (trigger, signal) = shutdown::channel();
//! let synchronizer = Arc::new(CacheSynchronizer::new(cache, store, locks));
//! tokio::spawn(cache_sync_task(synchronizer, CacheSyncConfig::default(), signal));
//!
//! // On shutdown
//! trigger.trigger();
//! ```

pub mod cache_sync;

// Re-export commonly used types
pub use cache_sync::{
    cache_sync_task, CacheSyncConfig, CacheSyncMetrics, CacheSyncSnapshot, CacheSynchronizer,
    SyncReport,
};
