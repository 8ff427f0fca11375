//! Set-difference planning for full and delta dumps.
//!
//! Planning is pure: it compares what harvesters were told (the published
//! set) with what is live at the window end, and never touches storage.

use super::chain::PublishedSet;
use crate::records::LiveSet;
use crate::types::{Record, RecordKey, Timestamp};
use std::sync::Arc;

/// Half-open interval `[start, end)` of upload timestamps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Window {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl Window {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, at: Timestamp) -> bool {
        self.start <= at && at < self.end
    }
}

/// Additions (ordered by key) and deletions (sorted) for one dump.
#[derive(Clone, Debug, Default)]
pub struct DeltaPlan {
    pub additions: Vec<Arc<Record>>,
    pub deletions: Vec<RecordKey>,
}

impl DeltaPlan {
    pub fn is_empty(&self) -> bool {
        self.additions.is_empty() && self.deletions.is_empty()
    }
}

/// Plan a delta.
///
/// A live record is added when it was created inside the window and either
/// differs from what was published or was deleted and re-added since the
/// window began. A published key is deleted when it is no longer live.
pub fn plan(published: &PublishedSet, live: &LiveSet, window: Window) -> DeltaPlan {
    let additions = live
        .iter()
        .filter(|entry| window.contains(entry.record.created_at))
        .filter(|entry| {
            entry.readded || published.checksum(&entry.record.key) != Some(&entry.record.checksum)
        })
        .map(|entry| Arc::clone(&entry.record))
        .collect();

    let mut deletions: Vec<RecordKey> = published
        .keys()
        .filter(|key| !live.contains(key))
        .cloned()
        .collect();
    deletions.sort();

    DeltaPlan {
        additions,
        deletions,
    }
}

/// Plan a full dump: every live record, nothing deleted.
pub fn plan_full(live: &LiveSet) -> DeltaPlan {
    DeltaPlan {
        additions: live.iter().map(|entry| Arc::clone(&entry.record)).collect(),
        deletions: Vec::new(),
    }
}
