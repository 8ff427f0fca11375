//! # POD Harvest
//!
//! Versioned exports of MARC record streams, harvestable over OAI-PMH.
//!
//! ## Core Concepts
//!
//! - **Streams**: An organization's records are grouped into streams; one
//!   stream per organization is the default
//! - **Uploads**: Append-only batches of records or of keys to delete
//! - **Dumps**: A full dump followed by deltas, each covering a time window
//!   and stored as gzip pages
//! - **OAI-PMH**: Harvesters page through the current dumps with resumption
//!   tokens
//!
//! ## Example
//!
//! ```ignore
//! use pod_harvest::{OaiConfig, OaiEngine, RecordInput, Repository, RepositoryConfig, UploadInput};
//! use std::sync::Arc;
//!
//! let repo = Arc::new(Repository::open_or_create(RepositoryConfig {
//!     path: "./pod-data".into(),
//!     ..Default::default()
//! })?);
//!
//! let stream = repo.create_stream("best-org", "")?;
//! repo.ingest(stream.id, UploadInput::records([
//!     RecordInput::new("a1", "<record><controlfield tag=\"001\">a1</controlfield></record>"),
//! ]))?;
//! repo.compute_delta(stream.id)?;
//!
//! let engine = OaiEngine::new(repo, OaiConfig::default());
//! let response = engine.respond(&[
//!     ("verb".into(), "ListRecords".into()),
//!     ("metadataPrefix".into(), "marc21".into()),
//! ])?;
//! ```

pub mod attachments;
pub mod config;
pub mod dumps;
pub mod error;
pub mod http;
pub mod journal;
pub mod oai;
pub mod records;
pub mod repository;
pub mod scheduler;
mod snapshot;
pub mod streams;
pub mod types;

// Re-exports
pub use attachments::{Attachment, AttachmentStore};
pub use config::AppConfig;
pub use dumps::{DeltaPlan, DumpKind, DumpManifest, NormalizedDump, PageKind, PageRef, Window};
pub use error::{HarvestError, Result};
pub use oai::{OaiConfig, OaiEngine, OaiError, OaiResponse, ResumptionToken, Verb};
pub use records::{LiveSet, RecordStore};
pub use repository::{DumpReport, Repository, RepositoryConfig, RepositoryStats};
pub use scheduler::{DumpScheduler, ErrorTracker, Job, JobKind, SchedulerConfig};
pub use streams::StreamRegistry;
pub use types::{
    DefaultStreamHistory, DumpId, Hash, Record, RecordInput, RecordKey, Stream, StreamId,
    StreamStatus, Timestamp, Upload, UploadContent, UploadId, UploadInput,
};
