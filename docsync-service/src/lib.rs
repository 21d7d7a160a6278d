//! docsync Service - Document Update Reconciliation Pipeline
//!
//! Consumes document update events from a message bus, reconciles each one
//! against the cache and durable store with the merge policy from
//! `docsync-core`, and publishes the canonical document back to the bus.
//! A background job periodically folds the cache into the durable store.
//!
//! Backends: LMDB or in-memory cache, PostgreSQL durable store, Redis
//! Streams bus. All collaborators are injected, so every component also runs
//! against the in-memory doubles used by the tests.

pub mod bus;
pub mod config;
pub mod constants;
pub mod db;
pub mod engine;
pub mod jobs;
pub mod locks;
pub mod pipeline;
pub mod shutdown;
pub mod telemetry;

// Re-export commonly used types
pub use bus::{EventBus, EventConsumer, EventProducer, MemoryBus, MemoryBusHandle, RedisStreamBus};
pub use config::{CacheBackendKind, ServiceConfig};
pub use db::{DbConfig, PgDocumentStore};
pub use engine::{LookupSource, Reconciled, ReconciliationEngine, RefreshPolicy, TtlPolicy};
pub use jobs::{cache_sync_task, CacheSyncConfig, CacheSynchronizer, SyncReport};
pub use locks::KeyLocks;
pub use pipeline::{Pipeline, PipelineConfig, PipelineMetrics, PipelineReport, PipelineSnapshot};
pub use shutdown::{ShutdownSignal, ShutdownTrigger};
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};
