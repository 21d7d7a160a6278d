//! Tracing Subscriber Initialization
//!
//! Installs a `tracing-subscriber` registry with an `EnvFilter` and either a
//! JSON or human-readable fmt layer.

use std::str::FromStr;

use docsync_core::{ConfigError, DocSyncResult};
use serde::Deserialize;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::constants::DEFAULT_LOG_FILTER;

/// Output format for log lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per event
    #[default]
    Json,
    /// Multi-line output for terminals
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "pretty" | "text" => Ok(Self::Pretty),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_format: LogFormat,
    /// Filter directives used when `RUST_LOG` is unset
    pub filter: Option<String>,
}

impl TelemetryConfig {
    /// Filter directives in effect: `RUST_LOG`, then the configured filter,
    /// then the built-in default.
    pub fn effective_filter(&self, rust_log: Option<String>) -> String {
        rust_log
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.filter.clone())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
    }
}

/// Initialize the global tracing subscriber.
///
/// Call once at startup. A second call fails because a global subscriber is
/// already installed.
pub fn init_tracing(config: &TelemetryConfig) -> DocSyncResult<()> {
    let directives = config.effective_filter(std::env::var(EnvFilter::DEFAULT_ENV).ok());
    let filter = EnvFilter::try_new(&directives).map_err(|e| ConfigError::InvalidValue {
        field: "telemetry.filter".to_string(),
        value: directives.clone(),
        reason: e.to_string(),
    })?;

    let registry = tracing_subscriber::registry().with(filter);
    let installed = match config.log_format {
        LogFormat::Json => registry.with(fmt::layer().json()).try_init(),
        LogFormat::Pretty => registry.with(fmt::layer().pretty()).try_init(),
    };
    installed.map_err(|e| ConfigError::InvalidValue {
        field: "telemetry".to_string(),
        value: format!("{:?}", config.log_format),
        reason: format!("Failed to init subscriber: {}", e),
    })?;

    tracing::info!(
        log_format = ?config.log_format,
        filter = %directives,
        "Telemetry initialized"
    );

    Ok(())
}
