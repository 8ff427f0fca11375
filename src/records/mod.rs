//! Record store: the ingestion side the dump engine reads from.
//!
//! Uploads are kept in an append-only log and indexed per stream in
//! `(created_at, id)` order, so the live record set of a stream at any
//! instant is an explicit replay rather than a mutable table.

mod index;
mod log;
mod marcxml;
mod store;

pub use index::{LiveRecord, LiveSet, RecordIndex};
pub use log::UploadLog;
pub use marcxml::{parse_deletes, split_collection};
pub use store::RecordStore;
