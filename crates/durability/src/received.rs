//! Snapshots assembled from replicated chunks
//!
//! A [`ReceivedSnapshot`] collects [`SnapshotChunk`]s from a remote replica
//! into a working directory under `pending/`. Chunks may arrive in any order
//! and may be repeated; each one is written at its declared file offset.
//!
//! The first chunk applied fixes the expected chunk count and combined
//! snapshot checksum. `persist` is accepted once every announced file is
//! present at its declared size and the recomputed combined checksum equals
//! the announced one.
//!
//! A failed `apply` leaves the receiver usable, so the caller can re-request
//! and re-apply the offending chunk.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapstore_core::{
    is_metadata_file, Result, SnapshotChunk, SnapshotError, SnapshotId, SnapshotMetadata,
};
use tracing::{debug, info, warn};

use crate::checksum::{chunk_checksum, ChecksumSet};
use crate::paths::{is_safe_file_name, list_file_names, remove_dir_if_exists};
use crate::persisted::PersistedSnapshot;
use crate::store::actor::StoreActor;
use crate::store::state::{read_metadata, CommitCandidate, CommitTarget, PendingSnapshot, StoreState};

/// Upper bound for the metadata file, which is buffered in memory
const MAX_METADATA_SIZE: u64 = 64 * 1024;

/// Pending-map entry of a received snapshot
#[derive(Debug)]
pub(crate) struct ReceivedState {
    id: SnapshotId,
    directory: PathBuf,
    expected_total_count: Option<u32>,
    expected_snapshot_checksum: Option<u64>,
    file_sizes: BTreeMap<String, u64>,
    whole_files: ChecksumSet,
    metadata_parts: BTreeMap<u64, Vec<u8>>,
    metadata: Option<SnapshotMetadata>,
}

impl ReceivedState {
    pub(crate) fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }

    fn new(id: SnapshotId, directory: PathBuf) -> Self {
        ReceivedState {
            id,
            directory,
            expected_total_count: None,
            expected_snapshot_checksum: None,
            file_sizes: BTreeMap::new(),
            whole_files: ChecksumSet::new(),
            metadata_parts: BTreeMap::new(),
            metadata: None,
        }
    }

    fn check_consistency(&self, chunk: &SnapshotChunk) -> Result<()> {
        let key = self.id.to_string();
        if chunk.snapshot_id != key {
            return Err(SnapshotError::write(
                &self.id,
                format!("chunk belongs to snapshot {}", chunk.snapshot_id),
            ));
        }
        if let Some(expected) = self.expected_total_count {
            if expected != chunk.total_count {
                return Err(SnapshotError::write(
                    &self.id,
                    format!(
                        "chunk announces {} files, expected {}",
                        chunk.total_count, expected
                    ),
                ));
            }
        }
        if let Some(expected) = self.expected_snapshot_checksum {
            if expected != chunk.snapshot_checksum {
                return Err(SnapshotError::write(
                    &self.id,
                    format!(
                        "chunk announces snapshot checksum {:08x}, expected {:08x}",
                        chunk.snapshot_checksum, expected
                    ),
                ));
            }
        }
        if let Some(size) = self.file_sizes.get(&chunk.chunk_name) {
            if *size != chunk.total_file_size {
                return Err(SnapshotError::write(
                    &self.id,
                    format!(
                        "chunk {} announces file size {}, expected {}",
                        chunk.id(),
                        chunk.total_file_size,
                        size
                    ),
                ));
            }
        }
        Ok(())
    }

    fn write_chunk(&self, chunk: &SnapshotChunk) -> Result<()> {
        if !is_safe_file_name(&chunk.chunk_name) {
            return Err(SnapshotError::write(
                &self.id,
                format!("invalid chunk name {:?}", chunk.chunk_name),
            ));
        }
        let end = chunk
            .end_position()
            .ok_or_else(|| SnapshotError::write(&self.id, format!("chunk {} offset overflows", chunk.id())))?;
        if end > chunk.total_file_size {
            return Err(SnapshotError::write(
                &self.id,
                format!(
                    "chunk {} ends at {} past file size {}",
                    chunk.id(),
                    end,
                    chunk.total_file_size
                ),
            ));
        }

        let path = self.directory.join(&chunk.chunk_name);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .and_then(|mut file| {
                file.seek(SeekFrom::Start(chunk.file_block_position))?;
                Ok(file)
            })
            .map_err(|e| SnapshotError::write(&self.id, format!("failed to open {}: {}", chunk.chunk_name, e)))?;
        file.write_all(&chunk.content)
            .map_err(|e| SnapshotError::write(&self.id, format!("failed to write {}: {}", chunk.id(), e)))?;
        Ok(())
    }

    /// Buffer a metadata chunk and decode once all bytes arrived
    fn buffer_metadata(&mut self, chunk: &SnapshotChunk) -> Result<()> {
        self.metadata_parts
            .insert(chunk.file_block_position, chunk.content.clone());

        let mut assembled = Vec::new();
        for (offset, part) in &self.metadata_parts {
            let offset = *offset as usize;
            if offset > assembled.len() {
                return Ok(());
            }
            let overlap = assembled.len() - offset;
            if part.len() > overlap {
                assembled.extend_from_slice(&part[overlap..]);
            }
        }
        if (assembled.len() as u64) < chunk.total_file_size {
            return Ok(());
        }

        self.metadata = Some(SnapshotMetadata::decode(&self.id, &assembled)?);
        self.metadata_parts.clear();
        Ok(())
    }

    fn apply(&mut self, chunk: SnapshotChunk) -> Result<()> {
        let actual = chunk_checksum(&chunk.content);
        if actual != chunk.checksum {
            return Err(SnapshotError::ChunkChecksumMismatch {
                chunk_name: chunk.id().to_string(),
                expected: chunk.checksum,
                actual,
            });
        }

        if is_metadata_file(&chunk.chunk_name) && chunk.total_file_size > MAX_METADATA_SIZE {
            return Err(SnapshotError::write(
                &self.id,
                format!(
                    "metadata file size {} exceeds {} bytes",
                    chunk.total_file_size, MAX_METADATA_SIZE
                ),
            ));
        }
        self.write_chunk(&chunk)?;

        self.expected_total_count.get_or_insert(chunk.total_count);
        self.expected_snapshot_checksum
            .get_or_insert(chunk.snapshot_checksum);
        self.file_sizes
            .insert(chunk.chunk_name.clone(), chunk.total_file_size);

        if chunk.file_block_position == 0 && chunk.completes_file() {
            self.whole_files
                .update_from_bytes(&chunk.chunk_name, &chunk.content);
        }
        if is_metadata_file(&chunk.chunk_name) {
            self.buffer_metadata(&chunk)?;
        }

        debug!(target: "snapstore::received", snapshot = %self.id, chunk = %chunk.id(), "Applied chunk");
        Ok(())
    }

    /// Check that every announced file is present at its declared size
    fn check_complete(&self) -> Result<()> {
        let Some(total_count) = self.expected_total_count else {
            return Err(self.incomplete("no chunks received"));
        };
        let files = list_file_names(&self.directory)?;
        if files.len() != total_count as usize {
            return Err(self.incomplete("file count differs from announced count"));
        }
        for (name, size) in &self.file_sizes {
            let actual = fs::metadata(self.directory.join(name))?.len();
            if actual != *size {
                return Err(self.incomplete("file is shorter than announced"));
            }
        }
        Ok(())
    }

    fn incomplete(&self, state: &'static str) -> SnapshotError {
        SnapshotError::InvalidState {
            id: self.id.to_string(),
            operation: "persist received snapshot",
            state,
        }
    }

    fn verify(&self, block_size: usize) -> Result<ChecksumSet> {
        let checksum = ChecksumSet::for_directory(&self.directory, block_size)
            .map_err(|e| SnapshotError::write(&self.id, e))?;

        let expected = self.expected_snapshot_checksum.unwrap_or_default();
        if u64::from(checksum.combined_value()) != expected {
            return Err(SnapshotError::corrupted(
                &self.id,
                format!(
                    "combined checksum {:08x} does not match announced {:08x}",
                    checksum.combined_value(),
                    expected
                ),
            ));
        }
        for (name, crc) in self.whole_files.file_checksums() {
            if checksum.file_checksum(name) != Some(*crc) {
                return Err(SnapshotError::corrupted(
                    &self.id,
                    format!("file {} changed after it was received", name),
                ));
            }
        }
        Ok(checksum)
    }
}

/// Handle to a snapshot being received from another replica
#[derive(Clone)]
pub struct ReceivedSnapshot {
    id: SnapshotId,
    directory: PathBuf,
    actor: StoreActor,
}

impl ReceivedSnapshot {
    /// Snapshot id
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Log index the snapshot covers
    pub fn index(&self) -> u64 {
        self.id.index()
    }

    /// Working directory chunks are written to
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Write one chunk into the working directory
    ///
    /// Chunks of a snapshot that is already committed are ignored.
    pub async fn apply(&self, chunk: SnapshotChunk) -> Result<()> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| state.apply_chunk(&key, chunk))
            .await
    }

    /// Verify the received files and commit the snapshot
    pub async fn persist(&self) -> Result<Arc<PersistedSnapshot>> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| state.persist_received(&key))
            .await
    }

    /// Delete the working directory; a no-op once persisted or aborted
    pub async fn abort(&self) -> Result<()> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| {
                if matches!(state.pending.get(&key), Some(PendingSnapshot::Received(_))) {
                    state.abort_pending(&key)?;
                }
                Ok(())
            })
            .await
    }
}

impl fmt::Debug for ReceivedSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceivedSnapshot")
            .field("id", &self.id.to_string())
            .field("directory", &self.directory)
            .finish()
    }
}

impl StoreState {
    /// Register a received snapshot, or resume one already being received
    pub(crate) fn new_received(&mut self, actor: StoreActor, snapshot_id: &str) -> Result<ReceivedSnapshot> {
        let id: SnapshotId = snapshot_id.parse()?;
        let key = id.to_string();

        match self.pending.get(&key) {
            Some(PendingSnapshot::Received(received)) => {
                debug!(target: "snapstore::received", snapshot = %id, "Resuming received snapshot");
                return Ok(ReceivedSnapshot {
                    directory: received.directory.clone(),
                    id,
                    actor,
                });
            }
            Some(PendingSnapshot::Transient(_)) => {
                return Err(SnapshotError::InvalidState {
                    id: key,
                    operation: "receive snapshot",
                    state: "transient pending",
                });
            }
            None => {}
        }

        let directory = self.paths().pending_snapshot_dir(&id);
        remove_dir_if_exists(&directory)?;
        fs::create_dir_all(&directory)?;
        self.pending.insert(
            key,
            PendingSnapshot::Received(ReceivedState::new(id.clone(), directory.clone())),
        );
        debug!(target: "snapstore::received", snapshot = %id, "Receiving snapshot");

        Ok(ReceivedSnapshot {
            id,
            directory,
            actor,
        })
    }

    fn apply_chunk(&mut self, key: &str, chunk: SnapshotChunk) -> Result<()> {
        let already_committed = key
            .parse::<SnapshotId>()
            .map(|id| self.current_has_id(&id))
            .unwrap_or(false);

        let received = match self.pending.get_mut(key) {
            Some(PendingSnapshot::Received(received)) => received,
            _ if already_committed => return Ok(()),
            _ => return Err(SnapshotError::NotFound { id: key.to_string() }),
        };
        received.check_consistency(&chunk)?;
        if already_committed {
            debug!(target: "snapstore::received", snapshot = %key, chunk = %chunk.id(), "Ignoring chunk of committed snapshot");
            return Ok(());
        }

        received.apply(chunk).map_err(|e| {
            warn!(target: "snapstore::received", snapshot = %key, error = %e, "Failed to apply chunk");
            e
        })
    }

    fn persist_received(&mut self, key: &str) -> Result<Arc<PersistedSnapshot>> {
        let received = match self.pending.get(key) {
            Some(PendingSnapshot::Received(received)) => received,
            Some(PendingSnapshot::Transient(_)) | None => {
                let id: SnapshotId = key.parse()?;
                return self.resolve_missing_pending(&id);
            }
        };
        if let Some(current) = self.current().filter(|c| c.id() == received.id()) {
            self.abort_pending(key)?;
            return Ok(current);
        }

        received.check_complete()?;
        let checksum = match received.verify(self.config().checksum_block_size) {
            Ok(checksum) => checksum,
            Err(e) => {
                warn!(target: "snapstore::received", snapshot = %key, error = %e, "Received snapshot failed verification, aborting");
                self.abort_pending(key)?;
                return Err(e);
            }
        };

        let Some(PendingSnapshot::Received(received)) = self.pending.remove(key) else {
            return Err(SnapshotError::NotFound { id: key.to_string() });
        };
        let metadata = match received.metadata {
            Some(metadata) => metadata,
            None => read_metadata(&received.id, &received.directory)?,
        };
        info!(
            target: "snapstore::received",
            snapshot = %received.id,
            files = checksum.file_checksums().len(),
            "Received snapshot complete"
        );

        let directory = received.directory;
        let candidate = CommitCandidate {
            id: received.id,
            directory: directory.clone(),
            checksum,
            metadata,
            target: CommitTarget::Main,
        };
        self.commit(candidate).map_err(|e| {
            let _ = remove_dir_if_exists(&directory);
            e
        })
    }
}
