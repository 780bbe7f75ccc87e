//! Durable snapshot store for snapstore
//!
//! This crate handles everything that touches disk:
//!
//! - Snapshot store: commit pipeline, eviction, reservations, bootstrap copies
//! - Transient snapshots: taken locally by a caller-supplied writer
//! - Received snapshots: assembled from replicated chunks
//! - Checksums: SFV-style per-file and combined CRC32C, the commit marker
//! - Chunk reader: resumable chunked transfer of a committed snapshot
//! - Recovery: startup scan that discards interrupted and corrupted snapshots
//! - Crash testing infrastructure

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod checksum; // SFV checksum files and CRC32C helpers
pub mod chunk_reader; // Chunked, seekable snapshot reader
pub mod config; // Store configuration
pub mod paths; // Partition root directory layout
pub mod persisted; // Committed snapshots
pub mod received; // Snapshots assembled from chunks
pub mod reservation; // In-memory and persisted holds
pub mod store; // SnapshotStore coordinator and serialized context
pub mod testing; // Manual clock, file helpers, crash harness
pub mod transient; // Locally taken snapshots

// === Re-exports ===
pub use checksum::{chunk_checksum, sorted_file_names, ChecksumError, ChecksumSet};
pub use chunk_reader::{SnapshotChunkReader, DEFAULT_MAX_CHUNK_SIZE};
pub use config::{ConfigError, SnapshotStoreConfig};
pub use paths::SnapshotPaths;
pub use persisted::PersistedSnapshot;
pub use received::ReceivedSnapshot;
pub use reservation::{
    Clock, ReservationError, ReservationStore, SnapshotReservation, SystemClock,
};
pub use store::{copy_snapshot_files, RecoveryReport, SnapshotListener, SnapshotStore};
pub use transient::TransientSnapshot;

// Core types callers need alongside the store
pub use snapstore_core::{
    ChunkId, Reservation, ReservationKind, ReservationReason, Result, SnapshotChunk,
    SnapshotError, SnapshotId, SnapshotMetadata, SnapshotPosition, METADATA_FILE_NAME,
};
