//! Durable storage interface
//!
//! The ingestion pipeline only talks to this trait. A recording counts as
//! durable when `exists` independently confirms the uploaded object, never
//! on upload success alone.

use std::error::Error as StdError;
use std::fmt;
use std::io::Read;

/// Storage errors, split by whether a retry can help
#[derive(Debug)]
pub enum StorageError {
    /// Connection failures, timeouts - retried with backoff
    Transient(String),
    /// Authentication failures, invalid paths - surfaced, not retried
    Permanent(String),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::Transient(msg) => write!(f, "Transient storage error: {}", msg),
            StorageError::Permanent(msg) => write!(f, "Permanent storage error: {}", msg),
        }
    }
}

impl StdError for StorageError {}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Opaque reference to an uploaded object (remote path for SFTP)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRef(pub String);

impl fmt::Display for StorageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Durable object store consumed by the ingestion pipeline.
/// Folder/namespace partitioning by owner is the caller's responsibility.
pub trait StorageClient: Send + Sync {
    /// Upload `size` bytes from `reader` as `folder/name`
    fn upload(
        &self,
        reader: &mut dyn Read,
        name: &str,
        folder: &str,
        size: u64,
    ) -> Result<StorageRef, StorageError>;

    /// Check that the object is retrievable; returns its size when present
    fn exists(&self, storage_ref: &StorageRef) -> Result<Option<u64>, StorageError>;

    /// Delete the object (retention policy hook, unused by the pipeline)
    fn delete(&self, storage_ref: &StorageRef) -> Result<(), StorageError>;
}
