//! Stream registry implementation.

use crate::error::{HarvestError, Result};
use crate::snapshot;
use crate::types::{DefaultStreamHistory, Stream, StreamId, StreamStatus, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Magic bytes for the registry file.
const REGISTRY_MAGIC: &[u8; 4] = b"STR\0";

/// Current registry format version.
const REGISTRY_VERSION: u8 = 1;

/// Registry contents stored on disk.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct RegistryIndex {
    /// All streams by ID.
    streams: BTreeMap<StreamId, Stream>,

    /// Default designation periods, in the order they began.
    history: Vec<DefaultStreamHistory>,

    /// Next stream ID to assign.
    next_id: u64,
}

/// Streams per organization and the history of which one was the default.
pub struct StreamRegistry {
    /// Path to the registry file.
    path: PathBuf,

    /// In-memory index, persisted after every change.
    index: RwLock<RegistryIndex>,
}

impl StreamRegistry {
    /// Load the registry, starting empty if it was never saved.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let index = snapshot::load(&path, REGISTRY_MAGIC, REGISTRY_VERSION)?.unwrap_or(
            RegistryIndex {
                next_id: 1,
                ..Default::default()
            },
        );

        Ok(Self {
            path,
            index: RwLock::new(index),
        })
    }

    /// Create a stream in an organization.
    ///
    /// The first stream of an organization becomes its default.
    pub fn create_stream(&self, organization: &str, name: &str, at: Timestamp) -> Result<Stream> {
        if organization.is_empty() {
            return Err(HarvestError::InvalidOperation(
                "organization slug must not be empty".into(),
            ));
        }

        let mut index = self.index.write();

        let first = !index
            .streams
            .values()
            .any(|s| s.organization == organization);

        let id = StreamId(index.next_id);
        index.next_id += 1;

        let stream = Stream {
            id,
            organization: organization.to_string(),
            name: name.to_string(),
            default: first,
            status: StreamStatus::Active,
            created_at: at,
        };

        index.streams.insert(id, stream.clone());
        if first {
            index.history.push(DefaultStreamHistory {
                stream: id,
                start_time: at,
                end_time: None,
            });
        }

        snapshot::save(&self.path, REGISTRY_MAGIC, REGISTRY_VERSION, &*index)?;
        Ok(stream)
    }

    /// Make a stream its organization's default, closing the previous
    /// default's history period.
    pub fn make_default(&self, id: StreamId, at: Timestamp) -> Result<Stream> {
        let mut index = self.index.write();

        let organization = match index.streams.get(&id) {
            Some(stream) if stream.default => return Ok(stream.clone()),
            Some(stream) if stream.status == StreamStatus::Archived => {
                return Err(HarvestError::InvalidOperation(format!(
                    "stream {id} is archived"
                )))
            }
            Some(stream) => stream.organization.clone(),
            None => return Err(HarvestError::StreamNotFound(id)),
        };

        let previous: Vec<StreamId> = index
            .streams
            .values()
            .filter(|s| s.organization == organization && s.default)
            .map(|s| s.id)
            .collect();

        for prev in &previous {
            if let Some(stream) = index.streams.get_mut(prev) {
                stream.default = false;
            }
        }
        for entry in index.history.iter_mut() {
            if previous.contains(&entry.stream) && entry.end_time.is_none() {
                entry.end_time = Some(at);
            }
        }

        index.history.push(DefaultStreamHistory {
            stream: id,
            start_time: at,
            end_time: None,
        });

        let stream = match index.streams.get_mut(&id) {
            Some(stream) => {
                stream.default = true;
                stream.clone()
            }
            None => return Err(HarvestError::StreamNotFound(id)),
        };

        snapshot::save(&self.path, REGISTRY_MAGIC, REGISTRY_VERSION, &*index)?;
        Ok(stream)
    }

    /// Archive a non-default stream; archived streams get no scheduled runs.
    pub fn archive(&self, id: StreamId) -> Result<Stream> {
        let mut index = self.index.write();

        let stream = index
            .streams
            .get_mut(&id)
            .ok_or(HarvestError::StreamNotFound(id))?;
        if stream.default {
            return Err(HarvestError::InvalidOperation(format!(
                "stream {id} is its organization's default"
            )));
        }
        stream.status = StreamStatus::Archived;
        let stream = stream.clone();

        snapshot::save(&self.path, REGISTRY_MAGIC, REGISTRY_VERSION, &*index)?;
        Ok(stream)
    }

    pub fn get(&self, id: StreamId) -> Result<Stream> {
        self.index
            .read()
            .streams
            .get(&id)
            .cloned()
            .ok_or(HarvestError::StreamNotFound(id))
    }

    pub fn exists(&self, id: StreamId) -> bool {
        self.index.read().streams.contains_key(&id)
    }

    /// All streams ordered by ID.
    pub fn list(&self) -> Vec<Stream> {
        self.index.read().streams.values().cloned().collect()
    }

    /// Streams of one organization ordered by ID.
    pub fn list_for(&self, organization: &str) -> Vec<Stream> {
        self.index
            .read()
            .streams
            .values()
            .filter(|s| s.organization == organization)
            .cloned()
            .collect()
    }

    /// The current default stream of an organization.
    pub fn default_for(&self, organization: &str) -> Option<Stream> {
        self.index
            .read()
            .streams
            .values()
            .find(|s| s.organization == organization && s.default)
            .cloned()
    }

    /// Default designation periods of a stream.
    pub fn history(&self, id: StreamId) -> Vec<DefaultStreamHistory> {
        self.index
            .read()
            .history
            .iter()
            .filter(|h| h.stream == id)
            .cloned()
            .collect()
    }

    /// Whether the stream has ever been its organization's default.
    pub fn has_default_history(&self, id: StreamId) -> bool {
        self.index.read().history.iter().any(|h| h.stream == id)
    }
}
