//! Timestamp-based merge policy.
//!
//! The rule compares the incoming event's `fetch_time` with the existing
//! record:
//!
//! ```text
//! incoming newer  -> take text + fetch_time        (fresh content)
//! incoming older  -> take pub_date, first_fetch_time = incoming.fetch_time
//!                                                  (backfilled history)
//! equal           -> no change
//! ```
//!
//! The equal branch keeps the existing text even when the incoming text
//! differs; an identical fetch timestamp is treated as the same fetch.

use crate::document::Document;

/// Which branch of the merge rule applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Incoming fetch is newer: content replaced.
    Refreshed,
    /// Incoming fetch is older: publish date and first fetch backfilled.
    Backfilled,
    /// Same fetch time: nothing changed.
    Unchanged,
}

impl MergeOutcome {
    /// Whether the merge modified any field.
    pub fn changed(&self) -> bool {
        !matches!(self, MergeOutcome::Unchanged)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeOutcome::Refreshed => "refreshed",
            MergeOutcome::Backfilled => "backfilled",
            MergeOutcome::Unchanged => "unchanged",
        }
    }
}

impl Document {
    /// Fold `incoming` into `self` in place.
    ///
    /// Both documents are expected to share a url; the url of `self` is
    /// never touched.
    pub fn merge_from(&mut self, incoming: &Document) -> MergeOutcome {
        if incoming.fetch_time > self.fetch_time {
            self.text.clone_from(&incoming.text);
            self.fetch_time = incoming.fetch_time;
            MergeOutcome::Refreshed
        } else if incoming.fetch_time < self.fetch_time {
            self.pub_date = incoming.pub_date;
            self.first_fetch_time = incoming.fetch_time;
            MergeOutcome::Backfilled
        } else {
            MergeOutcome::Unchanged
        }
    }

    /// Return the merge of `self` (existing) with `incoming`.
    pub fn merge(&self, incoming: &Document) -> Document {
        let mut merged = self.clone();
        merged.merge_from(incoming);
        merged
    }
}

/// Merge `incoming` into `existing`, returning the merged document.
pub fn merge(existing: &Document, incoming: &Document) -> Document {
    existing.merge(incoming)
}
