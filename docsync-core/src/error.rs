//! Error types for docsync operations

use thiserror::Error;

/// Storage layer errors (cache and durable store).
///
/// A missing key is not an error: lookups return `Ok(None)`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Document not found: {url}")]
    NotFound { url: String },

    #[error("Document already exists: {url}")]
    AlreadyExists { url: String },

    #[error("{backend} backend error: {reason}")]
    Backend { backend: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    /// Build a backend error from any displayable source.
    pub fn backend(backend: impl Into<String>, reason: impl ToString) -> Self {
        Self::Backend {
            backend: backend.into(),
            reason: reason.to_string(),
        }
    }
}

/// Wire codec errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to decode document: {reason}")]
    Decode { reason: String },

    #[error("Failed to encode document: {reason}")]
    Encode { reason: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

/// Message bus errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("Failed to receive from {stream}: {reason}")]
    Receive { stream: String, reason: String },

    #[error("Failed to send to {stream}: {reason}")]
    Send { stream: String, reason: String },

    #[error("Bus connection failed: {reason}")]
    Connect { reason: String },

    #[error("Bus channel closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Failed to load configuration from {path}: {reason}")]
    Load { path: String, reason: String },
}

/// Master error type for all docsync errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocSyncError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Task {task} aborted: {reason}")]
    TaskAborted { task: String, reason: String },
}

/// Result type alias for docsync operations.
pub type DocSyncResult<T> = Result<T, DocSyncError>;

// =============================================================================
// TESTS
// =============================================================================
