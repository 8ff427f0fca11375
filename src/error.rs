//! Error types for the harvesting repository.

use crate::oai::OaiError;
use crate::types::{DumpId, Hash, StreamId};
use thiserror::Error;

/// Main error type for repository operations.
#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stream not found: {0}")]
    StreamNotFound(StreamId),

    #[error("Dump not found: {0}")]
    DumpNotFound(DumpId),

    #[error("Attachment not found: {0}")]
    AttachmentNotFound(Hash),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Repository is locked by another process")]
    Locked,

    #[error("Repository not initialized")]
    NotInitialized,

    #[error("Invalid repository format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Hash mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: Hash, got: Hash },

    #[error("Malformed MARC-XML: {0}")]
    MalformedRecord(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error(transparent)]
    Oai(#[from] OaiError),
}

impl From<serde_json::Error> for HarvestError {
    fn from(e: serde_json::Error) -> Self {
        HarvestError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for HarvestError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        HarvestError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for HarvestError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        HarvestError::Deserialization(e.to_string())
    }
}

impl From<quick_xml::Error> for HarvestError {
    fn from(e: quick_xml::Error) -> Self {
        HarvestError::Xml(e.to_string())
    }
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, HarvestError>;
