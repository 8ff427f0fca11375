//! Core types shared by the record store, dump chains and the protocol engine.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Identifier of a stream (also its OAI-PMH `setSpec`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u64);

impl fmt::Debug for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamId({})", self.0)
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of an upload batch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UploadId(pub u64);

impl fmt::Debug for UploadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UploadId({})", self.0)
    }
}

/// Identifier of a normalized dump.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DumpId(pub u64);

impl fmt::Debug for DumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DumpId({})", self.0)
    }
}

impl fmt::Display for DumpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable external identifier of a record (the MARC 001 value).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey(pub String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        RecordKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordKey({})", self.0)
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey(s.to_string())
    }
}

/// Content hash (SHA-256), used for record checksums and attachment addresses.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Hash(arr))
    }

    /// First byte as hex, used as the shard directory name.
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// The Unix epoch, anchor of lazily created full dumps.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current time.
    pub fn now() -> Self {
        Timestamp(Utc::now().timestamp_micros())
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }

    pub fn to_datetime(self) -> DateTime<Utc> {
        let secs = self.0.div_euclid(1_000_000);
        let nanos = (self.0.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::from_timestamp(secs, nanos).unwrap_or_default()
    }

    /// Day granularity (`YYYY-MM-DD`), as used for OAI-PMH datestamps.
    pub fn date_string(self) -> String {
        self.to_datetime().format("%F").to_string()
    }

    /// Whole seconds shifted by `secs` (negative moves backwards).
    pub fn plus_secs(self, secs: i64) -> Self {
        Timestamp(self.0 + secs * 1_000_000)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_datetime().to_rfc3339_opts(SecondsFormat::Secs, true))
    }
}

/// A MARC record as accepted from an upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Record {
    /// Stable identifier (MARC 001).
    pub key: RecordKey,

    /// SHA-256 of the MARC-XML content.
    pub checksum: Hash,

    pub stream: StreamId,

    /// Upload batch the record arrived in.
    pub upload: UploadId,

    pub created_at: Timestamp,

    /// A single MARC-XML `<record>` element.
    pub marcxml: String,
}

/// Input for a record before the store assigns upload and timestamp.
#[derive(Clone, Debug)]
pub struct RecordInput {
    pub key: RecordKey,
    pub marcxml: String,
}

impl RecordInput {
    pub fn new(key: impl Into<String>, marcxml: impl Into<String>) -> Self {
        Self {
            key: RecordKey(key.into()),
            marcxml: marcxml.into(),
        }
    }

    /// Content checksum used to detect re-uploads of identical records.
    pub fn checksum(&self) -> Hash {
        Hash::from_bytes(self.marcxml.as_bytes())
    }
}

/// What an ingestion batch carries.
#[derive(Clone, Debug)]
pub enum UploadInput {
    /// Records to add (or replace, by key).
    Records(Vec<RecordInput>),
    /// Keys to remove from the live set.
    Deletes(Vec<RecordKey>),
}

impl UploadInput {
    pub fn records(records: impl IntoIterator<Item = RecordInput>) -> Self {
        UploadInput::Records(records.into_iter().collect())
    }

    pub fn deletes<K: Into<RecordKey>>(keys: impl IntoIterator<Item = K>) -> Self {
        UploadInput::Deletes(keys.into_iter().map(Into::into).collect())
    }
}

/// Content of a stored upload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum UploadContent {
    Records(Vec<Arc<Record>>),
    Deletes(Vec<RecordKey>),
}

/// A persisted upload batch.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Upload {
    pub id: UploadId,
    pub stream: StreamId,
    pub created_at: Timestamp,
    pub content: UploadContent,
}

impl Upload {
    /// Number of records or delete keys carried by this upload.
    pub fn len(&self) -> usize {
        match &self.content {
            UploadContent::Records(records) => records.len(),
            UploadContent::Deletes(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lifecycle status of a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StreamStatus {
    #[default]
    Active,
    Archived,
}

/// A named partition of an organization's records.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Stream {
    pub id: StreamId,

    /// Organization slug.
    pub organization: String,

    /// User-facing name; may be empty.
    pub name: String,

    /// Whether this is the organization's default stream.
    pub default: bool,

    pub status: StreamStatus,

    pub created_at: Timestamp,
}

impl Stream {
    /// Name shown to harvesters, falling back to the stream's time span.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        let start = self.created_at.date_string();
        if self.default {
            format!("{start} - ")
        } else {
            format!("{start} - {}", Timestamp::now().date_string())
        }
    }
}

/// One period during which a stream was its organization's default.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DefaultStreamHistory {
    pub stream: StreamId,
    pub start_time: Timestamp,
    pub end_time: Option<Timestamp>,
}
