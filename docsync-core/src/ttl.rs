//! Cache expiry policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Time-to-live applied when a document is written to the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheTtl {
    /// Never expires.
    #[default]
    Persistent,
    /// Expires after the duration, counted from this write.
    Expire(Duration),
    /// Keep the expiry of the entry being overwritten; new entries never expire.
    KeepExisting,
}

impl CacheTtl {
    /// Build a policy from a seconds value where zero means no expiry.
    pub fn from_secs(secs: u64) -> Self {
        if secs == 0 {
            CacheTtl::Persistent
        } else {
            CacheTtl::Expire(Duration::from_secs(secs))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_seconds_is_persistent() {
        assert_eq!(CacheTtl::from_secs(0), CacheTtl::Persistent);
    }

    #[test]
    fn test_nonzero_seconds_expire() {
        assert_eq!(
            CacheTtl::from_secs(30),
            CacheTtl::Expire(Duration::from_secs(30))
        );
    }
}
