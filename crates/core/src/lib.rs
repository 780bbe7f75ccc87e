//! Core types for the snapstore partition snapshot store
//!
//! This crate defines the values shared between the store and the systems
//! around it (state machine, replication transport, backup):
//! - SnapshotId / SnapshotPosition: identity and recency order of a snapshot
//! - SnapshotMetadata: positions recorded inside every snapshot
//! - SnapshotChunk / ChunkId: the unit of snapshot transfer
//! - Reservation: holds that keep a snapshot from being deleted
//! - SnapshotError: error type hierarchy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod chunk;
pub mod error;
pub mod id;
pub mod metadata;
pub mod reservation;

pub use chunk::{ChunkId, SnapshotChunk};
pub use error::{Result, SnapshotError};
pub use id::{
    parse_checksum_file_name, parse_snapshot_id, SnapshotId, SnapshotPosition, CHECKSUM_SUFFIX,
};
pub use metadata::{is_metadata_file, SnapshotMetadata, METADATA_FILE_NAME, METADATA_VERSION};
pub use reservation::{Reservation, ReservationKind, ReservationReason};
