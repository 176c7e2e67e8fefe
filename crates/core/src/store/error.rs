//! Error types for the bucket store.

use std::path::PathBuf;
use thiserror::Error;

use crate::normalize::BucketKey;

/// Errors that can occur while reading or writing buckets.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Failed to read a bucket or index file.
    #[error("Failed to read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to write, rename or delete a bucket or index file.
    #[error("Failed to write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File exists but does not parse.
    #[error("Corrupt file {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// File at a key's shard path belongs to another key.
    #[error("Bucket file {path} holds key {found}, expected {expected}")]
    KeyMismatch {
        path: PathBuf,
        expected: BucketKey,
        found: BucketKey,
    },

    /// Serialization of in-memory state failed.
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// The write-slot semaphore was closed (store shutting down).
    #[error("Write slots closed")]
    WriteSlotClosed,
}

impl StoreError {
    pub fn read(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Read {
            path: path.into(),
            source,
        }
    }

    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is in the data rather than the environment.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corrupt { .. } | Self::KeyMismatch { .. })
    }
}
