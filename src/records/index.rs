//! Per-stream upload index with point-in-time membership queries.

use crate::types::{Record, RecordKey, StreamId, Timestamp, Upload, UploadContent};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// A record that is live at the queried instant.
#[derive(Clone, Debug)]
pub struct LiveRecord {
    pub record: Arc<Record>,

    /// The key was removed by a delete upload at or after the replay's
    /// `since` boundary and added again afterwards.
    pub readded: bool,
}

/// The live record set of one stream at one instant, ordered by key.
#[derive(Clone, Debug, Default)]
pub struct LiveSet {
    records: BTreeMap<RecordKey, LiveRecord>,
}

impl LiveSet {
    pub fn get(&self, key: &RecordKey) -> Option<&LiveRecord> {
        self.records.get(key)
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveRecord> {
        self.records.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &RecordKey> {
        self.records.keys()
    }
}

/// Index of uploads per stream, each list kept in `(created_at, id)` order.
#[derive(Default)]
pub struct RecordIndex {
    streams: RwLock<HashMap<StreamId, Vec<Arc<Upload>>>>,
}

impl RecordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an upload, keeping the stream's timeline ordered.
    pub fn insert(&self, upload: Arc<Upload>) {
        let mut streams = self.streams.write();
        let timeline = streams.entry(upload.stream).or_default();
        let position = timeline
            .partition_point(|u| (u.created_at, u.id) <= (upload.created_at, upload.id));
        timeline.insert(position, upload);
    }

    /// All uploads of a stream in timeline order.
    pub fn uploads(&self, stream: StreamId) -> Vec<Arc<Upload>> {
        self.streams
            .read()
            .get(&stream)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of uploads across all streams.
    pub fn upload_count(&self) -> usize {
        self.streams.read().values().map(Vec::len).sum()
    }

    /// Timestamp of the most recent upload of a stream.
    pub fn latest_upload_at(&self, stream: StreamId) -> Option<Timestamp> {
        self.streams
            .read()
            .get(&stream)
            .and_then(|timeline| timeline.last())
            .map(|u| u.created_at)
    }

    /// Replay a stream's uploads created strictly before `at`.
    ///
    /// Record uploads insert or replace keys, delete uploads remove them.
    /// Keys deleted at or after `since` and then added again are flagged
    /// [`LiveRecord::readded`].
    pub fn live_at(&self, stream: StreamId, at: Timestamp, since: Timestamp) -> LiveSet {
        let timeline = self.uploads(stream);

        let mut records: BTreeMap<RecordKey, LiveRecord> = BTreeMap::new();
        let mut tombstoned: HashSet<RecordKey> = HashSet::new();

        for upload in timeline.iter().take_while(|u| u.created_at < at) {
            match &upload.content {
                UploadContent::Records(batch) => {
                    for record in batch {
                        let reinstated = tombstoned.remove(&record.key);
                        let previously = records
                            .get(&record.key)
                            .map(|live| live.readded)
                            .unwrap_or(false);
                        records.insert(
                            record.key.clone(),
                            LiveRecord {
                                record: Arc::clone(record),
                                readded: reinstated || previously,
                            },
                        );
                    }
                }
                UploadContent::Deletes(keys) => {
                    for key in keys {
                        records.remove(key);
                        if upload.created_at >= since {
                            tombstoned.insert(key.clone());
                        }
                    }
                }
            }
        }

        LiveSet { records }
    }
}
