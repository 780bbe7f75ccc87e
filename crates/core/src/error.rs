//! Error types for the snapshot store
//!
//! Every store operation resolves to [`Result`]. Only
//! [`SnapshotError::ConcurrentModification`] is fatal; everything else is
//! reported to the caller and left for it to retry or abort.

use std::io;
use thiserror::Error;

/// Result type alias for snapshot operations
pub type Result<T> = std::result::Result<T, SnapshotError>;

/// Errors raised by snapshot store operations
#[derive(Debug, Error)]
pub enum SnapshotError {
    /// A snapshot with this id is already the current one
    #[error("Snapshot {id} already exists")]
    AlreadyExists {
        /// Snapshot id
        id: String,
    },

    /// The snapshot was deleted or aborted before the operation ran
    #[error("Snapshot {id} not found")]
    NotFound {
        /// Snapshot id
        id: String,
    },

    /// Stored checksum disagrees with the files on disk
    #[error("Snapshot {id} is corrupted: {reason}")]
    Corrupted {
        /// Snapshot id
        id: String,
        /// What did not match
        reason: String,
    },

    /// Writing snapshot files or applying a chunk failed
    #[error("Failed to write snapshot {id}: {reason}")]
    Write {
        /// Snapshot id
        id: String,
        /// Failure description
        reason: String,
    },

    /// A received chunk's content does not hash to its declared checksum
    #[error("Chunk {chunk_name} checksum mismatch: expected {expected:#x}, computed {actual:#x}")]
    ChunkChecksumMismatch {
        /// Chunk (file) name
        chunk_name: String,
        /// Declared checksum
        expected: u64,
        /// Checksum of the received bytes
        actual: u64,
    },

    /// The current snapshot changed underneath a commit
    ///
    /// Commits are serialized, so this indicates a defect.
    #[error("Current snapshot changed concurrently: expected {expected:?}, found {actual:?}")]
    ConcurrentModification {
        /// Id the commit expected to replace
        expected: Option<String>,
        /// Id actually found
        actual: Option<String>,
    },

    /// Operation not allowed in the snapshot's current lifecycle state
    #[error("Cannot {operation} snapshot {id} in state {state}")]
    InvalidState {
        /// Snapshot id
        id: String,
        /// Attempted operation
        operation: &'static str,
        /// Lifecycle state at the time
        state: &'static str,
    },

    /// String is not a valid snapshot id
    #[error("Invalid snapshot id: {0}")]
    InvalidId(String),

    /// Reservation bookkeeping failed
    #[error("Reservation error: {0}")]
    Reservation(String),

    /// Store configuration rejected at open
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The store has been closed
    #[error("Snapshot store is closed")]
    Closed,
}

impl SnapshotError {
    /// True for errors that indicate a broken serialization discipline
    pub fn is_fatal(&self) -> bool {
        matches!(self, SnapshotError::ConcurrentModification { .. })
    }

    /// Build a [`SnapshotError::Write`] from any displayable cause
    pub fn write(id: impl ToString, reason: impl ToString) -> Self {
        SnapshotError::Write {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a [`SnapshotError::Corrupted`] from any displayable cause
    pub fn corrupted(id: impl ToString, reason: impl ToString) -> Self {
        SnapshotError::Corrupted {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_already_exists() {
        let err = SnapshotError::AlreadyExists {
            id: "10-1-100-50".to_string(),
        };
        assert!(err.to_string().contains("10-1-100-50"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_error_display_chunk_mismatch() {
        let err = SnapshotError::ChunkChecksumMismatch {
            chunk_name: "data.sst".to_string(),
            expected: 0xdead,
            actual: 0xbeef,
        };
        let msg = err.to_string();
        assert!(msg.contains("data.sst"));
        assert!(msg.contains("0xdead"));
        assert!(msg.contains("0xbeef"));
    }

    #[test]
    fn test_concurrent_modification_is_fatal() {
        let err = SnapshotError::ConcurrentModification {
            expected: None,
            actual: Some("1-1-1-1".to_string()),
        };
        assert!(err.is_fatal());
    }

    #[test]
    fn test_error_from_io() {
        let err: SnapshotError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, SnapshotError::Io(_)));
    }
}
