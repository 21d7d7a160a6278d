//! Service Configuration Module
//!
//! Configuration is layered:
//!
//! 1. Built-in defaults (see `constants.rs`)
//! 2. An optional YAML file named by `DOCSYNC_CONFIG`
//! 3. `DOCSYNC_*` environment variables, which also carry secrets
//!
//! The result is validated before the service starts.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use docsync_core::{CacheTtl, ConfigError};
use serde::Deserialize;

use crate::bus::redis_stream::RedisStreamConfig;
use crate::constants::{
    CONFIG_PATH_ENV, DEFAULT_CACHE_MAX_SIZE_MB, DEFAULT_CACHE_PATH, DEFAULT_CACHE_TTL_SECS,
    DEFAULT_SYNC_INTERVAL_SECS,
};
use crate::db::DbConfig;
use crate::engine::{RefreshPolicy, TtlPolicy};
use crate::jobs::CacheSyncConfig;
use crate::pipeline::PipelineConfig;
use crate::telemetry::TelemetryConfig;

// ============================================================================
// SECTIONS
// ============================================================================

/// Cache sync section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SyncSection {
    /// Seconds between sweeps
    pub interval_secs: u64,
    /// Evict expired cache entries before each sweep
    pub evict_expired: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            evict_expired: true,
        }
    }
}

impl SyncSection {
    pub fn job_config(&self) -> CacheSyncConfig {
        CacheSyncConfig {
            interval: Duration::from_secs(self.interval_secs),
            evict_expired: self.evict_expired,
        }
    }
}

/// Which cache implementation to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackendKind {
    #[default]
    Lmdb,
    Memory,
}

impl FromStr for CacheBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lmdb" => Ok(Self::Lmdb),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown cache backend '{}'", other)),
        }
    }
}

/// Cache section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub backend: CacheBackendKind,
    /// LMDB directory
    pub path: PathBuf,
    /// LMDB map size in megabytes
    pub max_size_mb: usize,
    /// Entry TTL in seconds; 0 means entries never expire
    pub ttl_secs: u64,
    /// Expiry handling when a cached entry is rewritten
    pub refresh: RefreshPolicy,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            backend: CacheBackendKind::default(),
            path: PathBuf::from(DEFAULT_CACHE_PATH),
            max_size_mb: DEFAULT_CACHE_MAX_SIZE_MB,
            ttl_secs: DEFAULT_CACHE_TTL_SECS,
            refresh: RefreshPolicy::default(),
        }
    }
}

impl CacheSection {
    pub fn ttl_policy(&self) -> TtlPolicy {
        TtlPolicy::new(CacheTtl::from_secs(self.ttl_secs), self.refresh)
    }
}

// ============================================================================
// SERVICE CONFIGURATION
// ============================================================================

/// Complete service configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub pipeline: PipelineConfig,
    pub sync: SyncSection,
    pub cache: CacheSection,
    pub db: DbConfig,
    pub bus: RedisStreamConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            sync: SyncSection::default(),
            cache: CacheSection::default(),
            db: DbConfig::default(),
            bus: RedisStreamConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load from defaults, the YAML file named by `DOCSYNC_CONFIG` (if set)
    /// and the process environment, then validate.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_yaml_file(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a YAML file. Missing sections and fields keep their defaults.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&raw).map_err(|e| match e {
            ConfigError::Load { reason, .. } => ConfigError::Load {
                path: path.display().to_string(),
                reason,
            },
            other => other,
        })
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|e| ConfigError::Load {
            path: "<inline>".to_string(),
            reason: e.to_string(),
        })
    }

    /// Apply `DOCSYNC_*` overrides read through `lookup`.
    ///
    /// # Environment Variables
    /// - `DOCSYNC_INCOMING_BUFFER`, `DOCSYNC_OUTGOING_BUFFER`: queue capacities
    /// - `DOCSYNC_RECONCILE_WORKERS`: reconcile stage concurrency
    /// - `DOCSYNC_SYNC_INTERVAL_SECS`: seconds between cache sync sweeps
    /// - `DOCSYNC_CACHE_BACKEND`: `lmdb` or `memory`
    /// - `DOCSYNC_CACHE_PATH`, `DOCSYNC_CACHE_MAX_SIZE_MB`: LMDB location and size
    /// - `DOCSYNC_CACHE_TTL_SECS`: cache TTL, 0 for none
    /// - `DOCSYNC_CACHE_REFRESH`: `reset` or `preserve`
    /// - `DOCSYNC_DB_HOST`, `DOCSYNC_DB_PORT`, `DOCSYNC_DB_NAME`,
    ///   `DOCSYNC_DB_USER`, `DOCSYNC_DB_PASSWORD`, `DOCSYNC_DB_POOL_SIZE`,
    ///   `DOCSYNC_DB_TIMEOUT_SECS`: PostgreSQL connection
    /// - `DOCSYNC_REDIS_URL`, `DOCSYNC_REDIS_OUTGOING_URL`: Redis endpoints
    /// - `DOCSYNC_INCOMING_STREAM`, `DOCSYNC_OUTGOING_STREAM`: stream names
    /// - `DOCSYNC_CONSUMER_GROUP`, `DOCSYNC_CONSUMER_NAME`: consumer identity
    /// - `DOCSYNC_LOG_FORMAT`: `json` or `pretty`
    /// - `DOCSYNC_LOG_FILTER`: tracing filter directives (`RUST_LOG` still wins)
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvOverrides { lookup };

        env.parse("DOCSYNC_INCOMING_BUFFER", &mut self.pipeline.incoming_buffer)?;
        env.parse("DOCSYNC_OUTGOING_BUFFER", &mut self.pipeline.outgoing_buffer)?;
        env.parse("DOCSYNC_RECONCILE_WORKERS", &mut self.pipeline.reconcile_workers)?;

        env.parse("DOCSYNC_SYNC_INTERVAL_SECS", &mut self.sync.interval_secs)?;

        env.parse("DOCSYNC_CACHE_BACKEND", &mut self.cache.backend)?;
        env.parse("DOCSYNC_CACHE_PATH", &mut self.cache.path)?;
        env.parse("DOCSYNC_CACHE_MAX_SIZE_MB", &mut self.cache.max_size_mb)?;
        env.parse("DOCSYNC_CACHE_TTL_SECS", &mut self.cache.ttl_secs)?;
        if let Some(raw) = env.get("DOCSYNC_CACHE_REFRESH") {
            self.cache.refresh = match raw.to_ascii_lowercase().as_str() {
                "reset" => RefreshPolicy::Reset,
                "preserve" => RefreshPolicy::Preserve,
                _ => return Err(invalid("DOCSYNC_CACHE_REFRESH", &raw, "expected reset or preserve")),
            };
        }

        env.parse("DOCSYNC_DB_HOST", &mut self.db.host)?;
        env.parse("DOCSYNC_DB_PORT", &mut self.db.port)?;
        env.parse("DOCSYNC_DB_NAME", &mut self.db.dbname)?;
        env.parse("DOCSYNC_DB_USER", &mut self.db.user)?;
        env.parse("DOCSYNC_DB_PASSWORD", &mut self.db.password)?;
        env.parse("DOCSYNC_DB_POOL_SIZE", &mut self.db.max_size)?;
        env.parse("DOCSYNC_DB_TIMEOUT_SECS", &mut self.db.timeout_secs)?;

        env.parse("DOCSYNC_REDIS_URL", &mut self.bus.url)?;
        if let Some(url) = env.get("DOCSYNC_REDIS_OUTGOING_URL") {
            self.bus.outgoing_url = Some(url);
        }
        env.parse("DOCSYNC_INCOMING_STREAM", &mut self.bus.incoming_stream)?;
        env.parse("DOCSYNC_OUTGOING_STREAM", &mut self.bus.outgoing_stream)?;
        env.parse("DOCSYNC_CONSUMER_GROUP", &mut self.bus.consumer_group)?;
        env.parse("DOCSYNC_CONSUMER_NAME", &mut self.bus.consumer_name)?;

        env.parse("DOCSYNC_LOG_FORMAT", &mut self.telemetry.log_format)?;
        if let Some(filter) = env.get("DOCSYNC_LOG_FILTER") {
            self.telemetry.filter = Some(filter);
        }

        Ok(())
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("pipeline.incoming_buffer", self.pipeline.incoming_buffer)?;
        positive("pipeline.outgoing_buffer", self.pipeline.outgoing_buffer)?;
        positive("pipeline.reconcile_workers", self.pipeline.reconcile_workers)?;
        positive("sync.interval_secs", self.sync.interval_secs)?;
        positive("db.max_size", self.db.max_size)?;
        positive("bus.read_batch", self.bus.read_batch)?;

        if self.cache.backend == CacheBackendKind::Lmdb {
            positive("cache.max_size_mb", self.cache.max_size_mb)?;
            if self.cache.path.as_os_str().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: "cache.path".to_string(),
                });
            }
        }

        for (field, value) in [
            ("bus.url", &self.bus.url),
            ("bus.incoming_stream", &self.bus.incoming_stream),
            ("bus.outgoing_stream", &self.bus.outgoing_stream),
            ("bus.consumer_group", &self.bus.consumer_group),
            ("bus.consumer_name", &self.bus.consumer_name),
            ("db.host", &self.db.host),
            ("db.dbname", &self.db.dbname),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::MissingRequired {
                    field: field.to_string(),
                });
            }
        }

        if self.bus.incoming_stream == self.bus.outgoing_stream
            && self.bus.producer_url() == self.bus.url
        {
            return Err(invalid(
                "bus.outgoing_stream",
                &self.bus.outgoing_stream,
                "must differ from the incoming stream",
            ));
        }

        Ok(())
    }
}

struct EnvOverrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvOverrides<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.is_empty())
    }

    fn parse<T>(&self, key: &str, target: &mut T) -> Result<(), ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        if let Some(raw) = self.get(key) {
            *target = raw
                .parse()
                .map_err(|e: T::Err| invalid(key, &raw, &e.to_string()))?;
        }
        Ok(())
    }
}

fn invalid(field: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn positive<T: Default + PartialEq>(field: &str, value: T) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(invalid(field, "0", "must be greater than 0"));
    }
    Ok(())
}
