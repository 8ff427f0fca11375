//! Content-addressed attachment storage.
//!
//! Dump pages and dump manifests are stored by their SHA-256 hash, sharded
//! into directories by the first byte of the hash. Identical content is
//! stored once and may be referenced by several dumps.

mod storage;

pub use storage::{Attachment, AttachmentStore};
