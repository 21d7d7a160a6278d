//! Constants for the docsync service
//!
//! Defaults for every configuration section live here so that config
//! loading, the background job and tests agree on them.

// ============================================================================
// PIPELINE
// ============================================================================

/// Default capacity of the consume -> reconcile queue
pub const DEFAULT_INCOMING_BUFFER: usize = 100;

/// Default capacity of the reconcile -> produce queue
pub const DEFAULT_OUTGOING_BUFFER: usize = 100;

/// Default number of reconcile workers
pub const DEFAULT_RECONCILE_WORKERS: usize = 1;

/// Number of shards in the per-key lock table
pub const DEFAULT_KEY_LOCK_SHARDS: usize = 64;

// ============================================================================
// CACHE SYNC
// ============================================================================

/// Default interval between cache-to-store sweeps (1 minute)
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 60;

// ============================================================================
// CACHE
// ============================================================================

/// Default LMDB cache directory
pub const DEFAULT_CACHE_PATH: &str = "./data/cache";

/// Default LMDB map size in megabytes
pub const DEFAULT_CACHE_MAX_SIZE_MB: usize = 1024;

/// Default cache TTL in seconds; 0 disables expiry
pub const DEFAULT_CACHE_TTL_SECS: u64 = 0;

// ============================================================================
// DATABASE
// ============================================================================

pub const DEFAULT_DB_HOST: &str = "localhost";
pub const DEFAULT_DB_PORT: u16 = 5432;
pub const DEFAULT_DB_NAME: &str = "docsync";
pub const DEFAULT_DB_USER: &str = "postgres";

/// Default maximum pool size
pub const DEFAULT_DB_POOL_SIZE: usize = 16;

/// Default connection timeout in seconds
pub const DEFAULT_DB_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// EVENT BUS
// ============================================================================

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_INCOMING_STREAM: &str = "documents.incoming";
pub const DEFAULT_OUTGOING_STREAM: &str = "documents.outgoing";
pub const DEFAULT_CONSUMER_GROUP: &str = "docsync";
pub const DEFAULT_CONSUMER_NAME: &str = "docsync-1";

/// Stream entry field carrying the encoded document
pub const STREAM_PAYLOAD_FIELD: &str = "payload";

/// Maximum entries fetched per XREADGROUP call
pub const DEFAULT_READ_BATCH: usize = 16;

/// How long a single XREADGROUP call blocks, in milliseconds
pub const DEFAULT_READ_BLOCK_MILLIS: usize = 1000;

// ============================================================================
// TELEMETRY
// ============================================================================

/// Filter used when neither `RUST_LOG` nor the config sets one
pub const DEFAULT_LOG_FILTER: &str = "docsync_service=info,docsync_storage=info,warn";

/// Name of the environment variable pointing at the YAML config file
pub const CONFIG_PATH_ENV: &str = "DOCSYNC_CONFIG";
