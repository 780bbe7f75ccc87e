//! Committed, checksum-verified snapshots
//!
//! A [`PersistedSnapshot`] is immutable once built. It is shared through an
//! `Arc` with chunk readers and reservation holders. The only state that
//! changes after construction is the `deleted` flag, set by the store's
//! serialized context when eviction removes the files.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use snapstore_core::{ReservationReason, Result, SnapshotError, SnapshotId, SnapshotMetadata};
use tracing::debug;

use crate::checksum::ChecksumSet;
use crate::chunk_reader::SnapshotChunkReader;
use crate::paths::{list_file_names, remove_dir_if_exists, remove_file_if_exists, sync_dir};
use crate::reservation::{Clock, ReservationStore, SnapshotReservation};

/// A committed snapshot
pub struct PersistedSnapshot {
    id: SnapshotId,
    directory: PathBuf,
    checksum_path: PathBuf,
    checksum: ChecksumSet,
    metadata: SnapshotMetadata,
    reservations: Arc<ReservationStore>,
    clock: Arc<dyn Clock>,
    deleted: AtomicBool,
}

impl PersistedSnapshot {
    pub(crate) fn new(
        id: SnapshotId,
        directory: PathBuf,
        checksum_path: PathBuf,
        checksum: ChecksumSet,
        metadata: SnapshotMetadata,
        reservations: Arc<ReservationStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        PersistedSnapshot {
            id,
            directory,
            checksum_path,
            checksum,
            metadata,
            reservations,
            clock,
            deleted: AtomicBool::new(false),
        }
    }

    /// Snapshot id
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Log index the snapshot covers
    pub fn index(&self) -> u64 {
        self.id.index()
    }

    /// Term of the covered index
    pub fn term(&self) -> u64 {
        self.id.term()
    }

    /// Highest log index that may be compacted while this snapshot is kept
    pub fn compaction_bound(&self) -> u64 {
        self.id.index()
    }

    /// Snapshot directory
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Commit marker
    pub fn checksum_path(&self) -> &Path {
        &self.checksum_path
    }

    /// Checksums computed over the snapshot files
    pub fn checksum(&self) -> &ChecksumSet {
        &self.checksum
    }

    /// Metadata read from, or synthesized for, the snapshot
    pub fn metadata(&self) -> &SnapshotMetadata {
        &self.metadata
    }

    /// Holds on this snapshot
    pub fn reservations(&self) -> &Arc<ReservationStore> {
        &self.reservations
    }

    /// File names in the snapshot directory
    pub fn files(&self) -> Result<Vec<String>> {
        self.ensure_not_deleted()?;
        Ok(list_file_names(&self.directory)?)
    }

    /// True once eviction removed the snapshot
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    /// True if an active reservation holds this snapshot
    pub fn is_reserved(&self) -> bool {
        self.reservations.is_reserved(self.clock.now_millis())
    }

    /// Open a chunk reader over the snapshot files
    pub fn new_chunk_reader(&self, max_chunk_size: usize) -> Result<SnapshotChunkReader> {
        self.ensure_not_deleted()?;
        Ok(SnapshotChunkReader::new(
            &self.directory,
            &self.id,
            u64::from(self.checksum.combined_value()),
        )?
        .with_max_chunk_size(max_chunk_size))
    }

    pub(crate) fn reserve(&self, reason: ReservationReason) -> Result<SnapshotReservation> {
        self.ensure_not_deleted()?;
        Ok(self.reservations.in_memory_reservation(reason))
    }

    /// Remove the snapshot from disk
    ///
    /// The checksum file goes first so that a crash part-way leaves a
    /// directory without a marker, which recovery discards.
    pub(crate) fn delete(&self, sync: bool) -> Result<()> {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        remove_file_if_exists(&self.checksum_path)?;
        if sync {
            if let Some(parent) = self.checksum_path.parent() {
                sync_dir(parent)?;
            }
        }
        remove_dir_if_exists(&self.directory)?;
        self.reservations.delete_file()?;
        debug!(target: "snapstore::store", snapshot = %self.id, "Deleted snapshot");
        Ok(())
    }

    fn ensure_not_deleted(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(SnapshotError::NotFound {
                id: self.id.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for PersistedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PersistedSnapshot")
            .field("id", &self.id.to_string())
            .field("directory", &self.directory)
            .field("combined_checksum", &self.checksum.combined_value())
            .field("metadata", &self.metadata)
            .field("deleted", &self.is_deleted())
            .finish()
    }
}
