//! Locally produced snapshots
//!
//! A [`TransientSnapshot`] is a handle to a working directory under
//! `pending/`. Its lifecycle runs on the store's serialized context:
//!
//! ```text
//! Created --take--> Taken --persist--> Persisted
//!    |                 |
//!    +-----abort-------+----> Aborted
//! ```
//!
//! `take` runs the caller's writer against the working directory and
//! checksums what it wrote. `persist` writes the metadata file, folds it into
//! the checksum last, and hands the snapshot to the store's commit procedure.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapstore_core::{Result, SnapshotError, SnapshotId, SnapshotMetadata, METADATA_FILE_NAME};
use tracing::{debug, warn};

use crate::checksum::ChecksumSet;
use crate::paths::{list_file_names, remove_dir_if_exists};
use crate::persisted::PersistedSnapshot;
use crate::store::actor::StoreActor;
use crate::store::state::{CommitCandidate, CommitTarget, PendingSnapshot, StoreState};

#[derive(Debug)]
enum TransientPhase {
    Created,
    Taken(ChecksumSet),
}

impl TransientPhase {
    fn name(&self) -> &'static str {
        match self {
            TransientPhase::Created => "created",
            TransientPhase::Taken(_) => "taken",
        }
    }
}

/// Pending-map entry of a transient snapshot
#[derive(Debug)]
pub(crate) struct TransientState {
    id: SnapshotId,
    directory: PathBuf,
    phase: TransientPhase,
    last_followup_event_position: i64,
}

impl TransientState {
    pub(crate) fn id(&self) -> &SnapshotId {
        &self.id
    }

    pub(crate) fn directory(&self) -> &Path {
        &self.directory
    }
}

/// Handle to a snapshot being taken locally
#[derive(Clone)]
pub struct TransientSnapshot {
    id: SnapshotId,
    directory: PathBuf,
    actor: StoreActor,
}

impl TransientSnapshot {
    /// Snapshot id
    pub fn id(&self) -> &SnapshotId {
        &self.id
    }

    /// Working directory the writer fills
    pub fn path(&self) -> &Path {
        &self.directory
    }

    /// Run `writer` against the working directory and checksum the result
    ///
    /// The snapshot is aborted if the writer fails or leaves the directory
    /// missing or empty.
    pub async fn take<F>(&self, writer: F) -> Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()> + Send + 'static,
    {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| state.take_transient(&key, writer))
            .await
    }

    /// Record the last follow-up event position written into the metadata
    pub async fn set_last_followup_event_position(&self, position: i64) -> Result<()> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| {
                let transient = state.transient_mut(&key)?;
                transient.last_followup_event_position = position;
                Ok(())
            })
            .await
    }

    /// Write the metadata file and commit the snapshot
    ///
    /// Persisting a snapshot that was already committed returns the committed
    /// snapshot again.
    pub async fn persist(&self) -> Result<Arc<PersistedSnapshot>> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| state.persist_transient(&key))
            .await
    }

    /// Delete the working directory; a no-op once persisted or aborted
    pub async fn abort(&self) -> Result<()> {
        let key = self.id.to_string();
        self.actor
            .try_call(move |state| {
                if matches!(state.pending.get(&key), Some(PendingSnapshot::Transient(_))) {
                    state.abort_pending(&key)?;
                }
                Ok(())
            })
            .await
    }
}

impl fmt::Debug for TransientSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransientSnapshot")
            .field("id", &self.id.to_string())
            .field("directory", &self.directory)
            .finish()
    }
}

impl StoreState {
    /// Register a new transient snapshot and create its working directory
    pub(crate) fn new_transient(
        &mut self,
        actor: StoreActor,
        index: u64,
        term: u64,
        processed_position: i64,
        exported_position: i64,
        force: bool,
    ) -> Result<TransientSnapshot> {
        let id = SnapshotId::new(
            index,
            term,
            processed_position,
            exported_position,
            self.config().broker_id,
        )?;

        if let Some(current) = self.current() {
            if !force && current.id().position() == id.position() {
                return Err(SnapshotError::AlreadyExists {
                    id: current.id().to_string(),
                });
            }
        }

        let key = id.to_string();
        if let Some(existing) = self.pending.get(&key) {
            return Err(SnapshotError::InvalidState {
                id: key,
                operation: "create transient snapshot",
                state: match existing {
                    PendingSnapshot::Transient(_) => "transient pending",
                    PendingSnapshot::Received(_) => "received pending",
                },
            });
        }

        let directory = self.paths().pending_snapshot_dir(&id);
        remove_dir_if_exists(&directory)?;
        fs::create_dir_all(&directory)?;

        self.pending.insert(
            key,
            PendingSnapshot::Transient(TransientState {
                id: id.clone(),
                directory: directory.clone(),
                phase: TransientPhase::Created,
                last_followup_event_position: i64::MAX,
            }),
        );
        debug!(target: "snapstore::transient", snapshot = %id, "Created transient snapshot");

        Ok(TransientSnapshot {
            id,
            directory,
            actor,
        })
    }

    fn transient_mut(&mut self, key: &str) -> Result<&mut TransientState> {
        match self.pending.get_mut(key) {
            Some(PendingSnapshot::Transient(transient)) => Ok(transient),
            _ => Err(SnapshotError::NotFound { id: key.to_string() }),
        }
    }

    fn take_transient<F>(&mut self, key: &str, writer: F) -> Result<()>
    where
        F: FnOnce(&Path) -> io::Result<()>,
    {
        let block_size = self.config().checksum_block_size;
        let transient = self.transient_mut(key)?;
        if !matches!(transient.phase, TransientPhase::Created) {
            return Err(SnapshotError::InvalidState {
                id: key.to_string(),
                operation: "take",
                state: transient.phase.name(),
            });
        }

        let id = transient.id.clone();
        let directory = transient.directory.clone();
        let taken = writer(&directory)
            .map_err(|e| SnapshotError::write(&id, format!("snapshot writer failed: {}", e)))
            .and_then(|()| match list_file_names(&directory) {
                Ok(files) if !files.is_empty() => Ok(()),
                Ok(_) => Err(SnapshotError::write(&id, "snapshot writer produced no files")),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Err(SnapshotError::write(
                    &id,
                    "snapshot directory was removed by the writer",
                )),
                Err(e) => Err(e.into()),
            })
            .and_then(|()| {
                ChecksumSet::for_directory_without_metadata(&directory, block_size)
                    .map_err(|e| SnapshotError::write(&id, e))
            });

        match taken {
            Ok(checksum) => {
                transient.phase = TransientPhase::Taken(checksum);
                debug!(target: "snapstore::transient", snapshot = %id, "Took transient snapshot");
                Ok(())
            }
            Err(e) => {
                warn!(target: "snapstore::transient", snapshot = %id, error = %e, "Failed to take snapshot, aborting");
                self.abort_pending(key)?;
                Err(e)
            }
        }
    }

    fn persist_transient(&mut self, key: &str) -> Result<Arc<PersistedSnapshot>> {
        let transient = match self.pending.get(key) {
            Some(PendingSnapshot::Transient(transient)) => transient,
            Some(PendingSnapshot::Received(_)) | None => {
                let id: SnapshotId = key.parse()?;
                return self.resolve_missing_pending(&id);
            }
        };
        if !matches!(transient.phase, TransientPhase::Taken(_)) {
            return Err(SnapshotError::InvalidState {
                id: key.to_string(),
                operation: "persist",
                state: transient.phase.name(),
            });
        }

        let Some(PendingSnapshot::Transient(transient)) = self.pending.remove(key) else {
            return Err(SnapshotError::NotFound { id: key.to_string() });
        };
        let TransientState {
            id,
            directory,
            phase,
            last_followup_event_position,
        } = transient;
        let TransientPhase::Taken(mut checksum) = phase else {
            return Err(SnapshotError::NotFound { id: key.to_string() });
        };

        let metadata = SnapshotMetadata::new(
            id.processed_position(),
            id.exported_position(),
            last_followup_event_position,
        );
        let written = metadata.encode().and_then(|bytes| {
            fs::write(directory.join(METADATA_FILE_NAME), &bytes)
                .map_err(|e| SnapshotError::write(&id, format!("failed to write metadata: {}", e)))?;
            Ok(bytes)
        });
        let bytes = match written {
            Ok(bytes) => bytes,
            Err(e) => {
                remove_dir_if_exists(&directory)?;
                return Err(e);
            }
        };
        checksum.update_from_bytes(METADATA_FILE_NAME, &bytes);

        let candidate = CommitCandidate {
            id,
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
