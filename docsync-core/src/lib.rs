//! docsync Core - Document Model and Merge Policy
//!
//! Pure data structures and the merge rule. All other crates depend on this.
//! Nothing in here performs I/O.

pub mod document;
pub mod error;
pub mod merge;
pub mod ttl;

pub use document::{Document, Timestamp};
pub use error::{BusError, CodecError, ConfigError, DocSyncError, DocSyncResult, StorageError};
pub use merge::{merge, MergeOutcome};
pub use ttl::CacheTtl;
