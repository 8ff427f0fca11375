//! Record store: upload log plus index.

use super::index::{LiveSet, RecordIndex};
use super::log::UploadLog;
use crate::error::Result;
use crate::types::{
    Record, StreamId, Timestamp, Upload, UploadContent, UploadId, UploadInput,
};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Durable, queryable collection of uploads.
pub struct RecordStore {
    log: UploadLog,
    index: RecordIndex,

    /// Next upload ID; held while appending so IDs follow log order.
    next_id: Mutex<u64>,
}

impl RecordStore {
    /// Open or create the store, rebuilding the index from the log.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (log, uploads) = UploadLog::open(path)?;

        let index = RecordIndex::new();
        let mut max_id = 0u64;
        for upload in uploads {
            max_id = max_id.max(upload.id.0);
            index.insert(Arc::new(upload));
        }

        Ok(Self {
            log,
            index,
            next_id: Mutex::new(max_id + 1),
        })
    }

    /// Persist an upload for a stream at the given time.
    pub fn ingest(&self, stream: StreamId, input: UploadInput, at: Timestamp) -> Result<Arc<Upload>> {
        let mut next_id = self.next_id.lock();
        let id = UploadId(*next_id);

        let content = match input {
            UploadInput::Records(records) => UploadContent::Records(
                records
                    .into_iter()
                    .map(|input| {
                        Arc::new(Record {
                            checksum: input.checksum(),
                            key: input.key,
                            stream,
                            upload: id,
                            created_at: at,
                            marcxml: input.marcxml,
                        })
                    })
                    .collect(),
            ),
            UploadInput::Deletes(keys) => UploadContent::Deletes(keys),
        };

        let upload = Arc::new(Upload {
            id,
            stream,
            created_at: at,
            content,
        });

        self.log.append(&upload)?;
        *next_id += 1;
        drop(next_id);

        self.index.insert(Arc::clone(&upload));
        Ok(upload)
    }

    /// Live record set of a stream just before `at`; see [`RecordIndex::live_at`].
    pub fn live_at(&self, stream: StreamId, at: Timestamp, since: Timestamp) -> LiveSet {
        self.index.live_at(stream, at, since)
    }

    pub fn uploads(&self, stream: StreamId) -> Vec<Arc<Upload>> {
        self.index.uploads(stream)
    }

    pub fn upload_count(&self) -> usize {
        self.index.upload_count()
    }

    pub fn latest_upload_at(&self, stream: StreamId) -> Option<Timestamp> {
        self.index.latest_upload_at(stream)
    }

    /// Size of the upload log in bytes.
    pub fn size_bytes(&self) -> Result<u64> {
        self.log.size()
    }
}
