//! Coordinator state owned by the serialized context
//!
//! Holds the available snapshots, the pending (in-flight) snapshots, the
//! bootstrap slot and the listeners, and implements the commit procedure and
//! eviction policy shared by transient and received snapshots.
//!
//! # Commit procedure
//!
//! 1. An id equal to the current snapshot's is a no-op success.
//! 2. An id whose position is not newer than the current one is discarded;
//!    the current snapshot is returned unchanged.
//! 3. Otherwise the working directory is renamed into `snapshots/`, then the
//!    checksum file is written and renamed into place. That rename is the
//!    commit point.
//! 4. The new snapshot replaces the current one by compare-and-swap, older
//!    unreserved snapshots and older pending snapshots are removed, and
//!    listeners are notified.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapstore_core::{
    is_metadata_file, parse_snapshot_id, Reservation, ReservationReason, Result, SnapshotError,
    SnapshotId, SnapshotMetadata, METADATA_FILE_NAME,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checksum::ChecksumSet;
use crate::config::SnapshotStoreConfig;
use crate::paths::{
    clear_dir, is_safe_file_name, list_file_names, remove_dir_if_exists, remove_file_if_exists,
    sync_dir, sync_dir_contents, SnapshotPaths,
};
use crate::persisted::PersistedSnapshot;
use crate::received::ReceivedState;
use crate::reservation::{Clock, ReservationStore, SnapshotReservation};
use crate::transient::TransientState;

use super::slot::CurrentSnapshotSlot;
use super::SnapshotListener;

/// Where a finished snapshot is committed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CommitTarget {
    /// `snapshots/`, becoming the current snapshot
    Main,
    /// `bootstrap-snapshots/`, filling the bootstrap slot
    Bootstrap,
}

/// An in-flight snapshot, keyed in the pending map
#[derive(Debug)]
pub(crate) enum PendingSnapshot {
    Transient(TransientState),
    Received(ReceivedState),
}

impl PendingSnapshot {
    pub(crate) fn id(&self) -> &SnapshotId {
        match self {
            PendingSnapshot::Transient(t) => t.id(),
            PendingSnapshot::Received(r) => r.id(),
        }
    }

    pub(crate) fn directory(&self) -> &Path {
        match self {
            PendingSnapshot::Transient(t) => t.directory(),
            PendingSnapshot::Received(r) => r.directory(),
        }
    }
}

/// A finished snapshot ready to commit
#[derive(Debug)]
pub(crate) struct CommitCandidate {
    pub(crate) id: SnapshotId,
    pub(crate) directory: PathBuf,
    pub(crate) checksum: ChecksumSet,
    pub(crate) metadata: SnapshotMetadata,
    pub(crate) target: CommitTarget,
}

/// State of one snapshot store, mutated only on its serialized context
pub(crate) struct StoreState {
    config: SnapshotStoreConfig,
    paths: SnapshotPaths,
    clock: Arc<dyn Clock>,
    current: Arc<CurrentSnapshotSlot>,
    available: BTreeMap<String, Arc<PersistedSnapshot>>,
    pub(crate) pending: HashMap<String, PendingSnapshot>,
    bootstrap: Option<Arc<PersistedSnapshot>>,
    listeners: Vec<Arc<dyn SnapshotListener>>,
}

impl StoreState {
    pub(crate) fn new(
        config: SnapshotStoreConfig,
        clock: Arc<dyn Clock>,
        current: Arc<CurrentSnapshotSlot>,
        available: BTreeMap<String, Arc<PersistedSnapshot>>,
    ) -> Self {
        let paths = SnapshotPaths::from_root(&config.root);
        StoreState {
            config,
            paths,
            clock,
            current,
            available,
            pending: HashMap::new(),
            bootstrap: None,
            listeners: Vec::new(),
        }
    }

    pub(crate) fn config(&self) -> &SnapshotStoreConfig {
        &self.config
    }

    pub(crate) fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    pub(crate) fn current(&self) -> Option<Arc<PersistedSnapshot>> {
        self.current.load()
    }

    pub(crate) fn current_has_id(&self, id: &SnapshotId) -> bool {
        self.current().is_some_and(|c| c.id() == id)
    }

    pub(crate) fn available_snapshots(&self) -> Vec<Arc<PersistedSnapshot>> {
        let mut snapshots: Vec<Arc<PersistedSnapshot>> = self.available.values().cloned().collect();
        snapshots.sort_by_key(|s| s.id().position());
        snapshots
    }

    pub(crate) fn compaction_bound(&self) -> Option<u64> {
        self.available.values().map(|s| s.compaction_bound()).min()
    }

    pub(crate) fn bootstrap_snapshot(&self) -> Option<Arc<PersistedSnapshot>> {
        self.bootstrap.clone()
    }

    pub(crate) fn add_listener(&mut self, listener: Arc<dyn SnapshotListener>) {
        self.listeners.push(listener);
    }

    pub(crate) fn remove_listener(&mut self, listener: &Arc<dyn SnapshotListener>) {
        self.listeners.retain(|l| !Arc::ptr_eq(l, listener));
    }

    /// Result of persisting a pending snapshot that is no longer pending
    ///
    /// A retried persist after success resolves to the committed snapshot;
    /// anything else was aborted.
    pub(crate) fn resolve_missing_pending(&self, id: &SnapshotId) -> Result<Arc<PersistedSnapshot>> {
        if let Some(current) = self.current().filter(|c| c.id() == id) {
            return Ok(current);
        }
        if let Some(bootstrap) = self.bootstrap.clone().filter(|b| b.id() == id) {
            return Ok(bootstrap);
        }
        Err(SnapshotError::NotFound { id: id.to_string() })
    }

    /// Abort a pending snapshot and delete its working directory
    pub(crate) fn abort_pending(&mut self, key: &str) -> Result<()> {
        if let Some(pending) = self.pending.remove(key) {
            remove_dir_if_exists(pending.directory())?;
            debug!(target: "snapstore::store", snapshot = %pending.id(), "Aborted pending snapshot");
        }
        Ok(())
    }

    /// Commit a finished snapshot, see the module docs
    pub(crate) fn commit(&mut self, candidate: CommitCandidate) -> Result<Arc<PersistedSnapshot>> {
        match candidate.target {
            CommitTarget::Main => self.commit_main(candidate),
            CommitTarget::Bootstrap => self.commit_bootstrap(candidate),
        }
    }

    fn commit_main(&mut self, candidate: CommitCandidate) -> Result<Arc<PersistedSnapshot>> {
        let previous = self.current();
        if let Some(current) = &previous {
            if current.id() == &candidate.id {
                debug!(target: "snapstore::store", snapshot = %candidate.id, "Snapshot already committed");
                remove_dir_if_exists(&candidate.directory)?;
                return Ok(Arc::clone(current));
            }
            if !candidate.id.is_newer_than(current.id()) {
                info!(
                    target: "snapstore::store",
                    partition = self.config.partition_id,
                    snapshot = %candidate.id,
                    current = %current.id(),
                    "Discarding snapshot that is not newer than the current one"
                );
                remove_dir_if_exists(&candidate.directory)?;
                let current = Arc::clone(current);
                self.purge_pending_older_than(current.id());
                return Ok(current);
            }
        }

        let id = candidate.id.clone();
        let sync = self.config.sync_on_commit;
        let destination = self.paths.snapshot_dir(&id);
        let checksum_path = self.paths.checksum_path(&id);

        if sync {
            sync_dir_contents(&candidate.directory).map_err(|e| {
                SnapshotError::write(&id, format!("failed to sync snapshot files: {}", e))
            })?;
        }
        remove_file_if_exists(&checksum_path)?;
        remove_dir_if_exists(&destination)?;
        fs::rename(&candidate.directory, &destination)
            .map_err(|e| SnapshotError::write(&id, format!("failed to move snapshot: {}", e)))?;
        if sync {
            sync_dir(&self.paths.snapshots_dir())?;
        }

        if let Err(e) = candidate.checksum.persist(&checksum_path, sync) {
            remove_dir_if_exists(&destination)?;
            return Err(SnapshotError::write(
                &id,
                format!("failed to write checksum file: {}", e),
            ));
        }

        let reservations = Arc::new(ReservationStore::new(
            id.clone(),
            self.paths.reservation_path(&id),
            sync,
        ));
        let snapshot = Arc::new(PersistedSnapshot::new(
            id.clone(),
            destination,
            checksum_path,
            candidate.checksum,
            candidate.metadata,
            reservations,
            Arc::clone(&self.clock),
        ));

        if let Err(actual) = self
            .current
            .compare_and_swap(previous.as_ref(), Some(Arc::clone(&snapshot)))
        {
            let err = SnapshotError::ConcurrentModification {
                expected: previous.map(|p| p.id().to_string()),
                actual: actual.map(|a| a.id().to_string()),
            };
            error!(
                target: "snapstore::store",
                partition = self.config.partition_id,
                snapshot = %id,
                error = %err,
                "Current snapshot was replaced outside the serialized context"
            );
            return Err(err);
        }

        self.available.insert(id.to_string(), Arc::clone(&snapshot));
        info!(
            target: "snapstore::store",
            partition = self.config.partition_id,
            snapshot = %id,
            combined_checksum = snapshot.checksum().combined_value(),
            "Committed new snapshot"
        );

        self.evict(&snapshot);
        for listener in &self.listeners {
            listener.on_new_snapshot(&snapshot);
        }
        Ok(snapshot)
    }

    fn commit_bootstrap(&mut self, candidate: CommitCandidate) -> Result<Arc<PersistedSnapshot>> {
        let id = candidate.id.clone();
        let sync = self.config.sync_on_commit;
        let checksum_path = self.paths.bootstrap_checksum_path(&id);
        if sync {
            sync_dir_contents(&candidate.directory)?;
        }

        if let Err(e) = candidate.checksum.persist(&checksum_path, sync) {
            remove_dir_if_exists(&candidate.directory)?;
            return Err(SnapshotError::write(
                &id,
                format!("failed to write checksum file: {}", e),
            ));
        }

        let reservations = Arc::new(ReservationStore::new(
            id.clone(),
            self.paths.reservation_path(&id),
            sync,
        ));
        let snapshot = Arc::new(PersistedSnapshot::new(
            id.clone(),
            candidate.directory,
            checksum_path,
            candidate.checksum,
            candidate.metadata,
            reservations,
            Arc::clone(&self.clock),
        ));
        self.bootstrap = Some(Arc::clone(&snapshot));
        info!(target: "snapstore::store", partition = self.config.partition_id, snapshot = %id, "Committed bootstrap snapshot");
        Ok(snapshot)
    }

    /// Eviction policy, run after every main commit
    fn evict(&mut self, current: &Arc<PersistedSnapshot>) {
        let now = self.clock.now_millis();
        let current_key = current.id().to_string();
        let sync = self.config.sync_on_commit;

        let mut evicted = Vec::new();
        for (key, snapshot) in &self.available {
            if *key == current_key {
                continue;
            }
            if snapshot.reservations().is_reserved(now) {
                debug!(target: "snapstore::store", snapshot = %key, "Keeping reserved snapshot");
                continue;
            }
            match snapshot.delete(sync) {
                Ok(()) => evicted.push(key.clone()),
                Err(e) => warn!(
                    target: "snapstore::store",
                    snapshot = %key,
                    error = %e,
                    "Failed to delete superseded snapshot"
                ),
            }
        }
        for key in evicted {
            self.available.remove(&key);
        }

        self.purge_pending_older_than(current.id());
    }

    /// Abort pending snapshots older than `id` and remove orphaned pending directories
    fn purge_pending_older_than(&mut self, id: &SnapshotId) {
        let stale: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| id.is_newer_than(p.id()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            if let Err(e) = self.abort_pending(&key) {
                warn!(target: "snapstore::store", snapshot = %key, error = %e, "Failed to abort stale pending snapshot");
            }
        }

        let covered: Vec<PathBuf> = self
            .pending
            .values()
            .map(|p| p.directory().to_path_buf())
            .collect();
        let entries = match fs::read_dir(self.paths.pending_dir()) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(target: "snapstore::store", error = %e, "Failed to list pending directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if covered.contains(&path) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(orphan) = parse_snapshot_id(&name) else {
                continue;
            };
            if id.is_newer_than(&orphan) {
                debug!(target: "snapstore::store", snapshot = %orphan, "Removing orphaned pending directory");
                if let Err(e) = remove_dir_if_exists(&path) {
                    warn!(target: "snapstore::store", path = %path.display(), error = %e, "Failed to remove orphaned pending directory");
                }
            }
        }
    }

    fn find_available(&self, id: &SnapshotId) -> Result<&Arc<PersistedSnapshot>> {
        self.available
            .get(&id.to_string())
            .filter(|s| !s.is_deleted())
            .ok_or_else(|| SnapshotError::NotFound { id: id.to_string() })
    }

    pub(crate) fn reserve(
        &self,
        id: &SnapshotId,
        reason: ReservationReason,
    ) -> Result<SnapshotReservation> {
        self.find_available(id)?.reserve(reason)
    }

    pub(crate) fn reserve_persisted(
        &self,
        id: &SnapshotId,
        valid_until: i64,
        reason: ReservationReason,
    ) -> Result<Reservation> {
        let snapshot = self.find_available(id)?;
        Ok(snapshot
            .reservations()
            .persisted_reservation(valid_until, reason)?)
    }

    pub(crate) fn remove_persisted_reservation(&self, id: &SnapshotId, reservation: Uuid) -> Result<bool> {
        let snapshot = self.find_available(id)?;
        Ok(snapshot.reservations().remove_persisted(reservation)?)
    }

    /// Abort every pending snapshot and empty `pending/`
    pub(crate) fn purge_pending_snapshots(&mut self) -> Result<()> {
        let keys: Vec<String> = self.pending.keys().cloned().collect();
        for key in keys {
            self.abort_pending(&key)?;
        }
        let removed = clear_dir(&self.paths.pending_dir())?;
        debug!(target: "snapstore::store", removed, "Purged pending snapshots");
        Ok(())
    }

    /// Copy the current snapshot into `bootstrap-snapshots/` and commit it there
    ///
    /// `copier` copies the data files from the current snapshot directory
    /// into the (empty) bootstrap directory. The metadata file is written by
    /// the store. The copy's id keeps the current positions but zeroes the
    /// index and term, so it never competes with regular snapshots.
    pub(crate) fn copy_for_bootstrap<F>(&mut self, copier: F) -> Result<Arc<PersistedSnapshot>>
    where
        F: FnOnce(&Path, &Path) -> std::io::Result<()>,
    {
        let current = self.current().ok_or_else(|| SnapshotError::NotFound {
            id: "current snapshot".to_string(),
        })?;
        if let Some(existing) = &self.bootstrap {
            return Err(SnapshotError::AlreadyExists {
                id: existing.id().to_string(),
            });
        }

        let id = current.id().bootstrap_id();
        let directory = self.paths.bootstrap_snapshot_dir(&id);
        remove_file_if_exists(&self.paths.bootstrap_checksum_path(&id))?;
        remove_dir_if_exists(&directory)?;
        fs::create_dir_all(&directory)?;

        let block_size = self.config.checksum_block_size;
        let prepared = (|| -> Result<CommitCandidate> {
            copier(current.path(), &directory)
                .map_err(|e| SnapshotError::write(&id, format!("failed to copy snapshot: {}", e)))?;
            let mut checksum = ChecksumSet::for_directory_without_metadata(&directory, block_size)
                .map_err(|e| SnapshotError::write(&id, e))?;
            let metadata = *current.metadata();
            let bytes = metadata.encode()?;
            fs::write(directory.join(METADATA_FILE_NAME), &bytes)?;
            checksum.update_from_bytes(METADATA_FILE_NAME, &bytes);
            Ok(CommitCandidate {
                id: id.clone(),
                directory: directory.clone(),
                checksum,
                metadata,
                target: CommitTarget::Bootstrap,
            })
        })();

        match prepared {
            Ok(candidate) => self.commit(candidate),
            Err(e) => {
                warn!(target: "snapstore::store", snapshot = %id, error = %e, "Failed to copy snapshot for bootstrap");
                remove_dir_if_exists(&directory)?;
                Err(e)
            }
        }
    }

    /// Remove the bootstrap snapshot
    pub(crate) fn delete_bootstrap_snapshots(&mut self) -> Result<()> {
        if let Some(bootstrap) = self.bootstrap.take() {
            bootstrap.delete(self.config.sync_on_commit)?;
        }
        clear_dir(&self.paths.bootstrap_dir())?;
        Ok(())
    }

    /// Remove every snapshot, reservation and pending directory
    pub(crate) fn delete_all(&mut self) -> Result<()> {
        let keys: Vec<String> = self.pending.keys().cloned().collect();
        for key in keys {
            self.abort_pending(&key)?;
        }
        self.current.clear();
        for snapshot in std::mem::take(&mut self.available).into_values() {
            snapshot.delete(self.config.sync_on_commit)?;
        }
        self.delete_bootstrap_snapshots()?;
        clear_dir(&self.paths.snapshots_dir())?;
        clear_dir(&self.paths.pending_dir())?;
        clear_dir(&self.paths.reservations_dir())?;
        info!(target: "snapstore::store", partition = self.config.partition_id, "Deleted all snapshots");
        Ok(())
    }

    /// Install a snapshot copied from a backup
    ///
    /// `files` maps file names to source paths and must include the
    /// snapshot's checksum file. Only valid while the store has no snapshot.
    pub(crate) fn restore(
        &mut self,
        id: SnapshotId,
        files: BTreeMap<String, PathBuf>,
    ) -> Result<Arc<PersistedSnapshot>> {
        if let Some(current) = self.current() {
            return Err(SnapshotError::InvalidState {
                id: current.id().to_string(),
                operation: "restore into store holding",
                state: "persisted",
            });
        }

        let checksum_name = id.checksum_file_name();
        let checksum_source = files
            .get(&checksum_name)
            .ok_or_else(|| SnapshotError::corrupted(&id, "backup has no checksum file"))?;
        let expected = ChecksumSet::read_file(checksum_source)
            .map_err(|e| SnapshotError::corrupted(&id, e))?;

        if let Some(name) = files.keys().find(|name| !is_safe_file_name(name)) {
            return Err(SnapshotError::write(&id, format!("invalid backup file name {:?}", name)));
        }

        let directory = self.paths.pending_snapshot_dir(&id);
        remove_dir_if_exists(&directory)?;
        fs::create_dir_all(&directory)?;
        let (actual, metadata) = match self.stage_restore(&id, &directory, &files, &expected) {
            Ok(staged) => staged,
            Err(e) => {
                remove_dir_if_exists(&directory)?;
                return Err(e);
            }
        };

        let candidate = CommitCandidate {
            id: id.clone(),
            directory,
            checksum: actual,
            metadata,
            target: CommitTarget::Main,
        };
        info!(target: "snapstore::store", partition = self.config.partition_id, snapshot = %id, "Restoring snapshot from backup");
        let directory = candidate.directory.clone();
        self.commit(candidate).map_err(|e| {
            let _ = remove_dir_if_exists(&directory);
            e
        })
    }

    /// Copy backup files into `directory` and verify them against `expected`
    fn stage_restore(
        &self,
        id: &SnapshotId,
        directory: &Path,
        files: &BTreeMap<String, PathBuf>,
        expected: &ChecksumSet,
    ) -> Result<(ChecksumSet, SnapshotMetadata)> {
        let checksum_name = id.checksum_file_name();
        for (name, source) in files.iter().filter(|(name, _)| **name != checksum_name) {
            fs::copy(source, directory.join(name))
                .map_err(|e| SnapshotError::write(id, format!("failed to copy {}: {}", name, e)))?;
        }

        let actual = ChecksumSet::for_directory(directory, self.config.checksum_block_size)
            .map_err(|e| SnapshotError::write(id, e))?;
        if !actual.matches(expected) {
            return Err(SnapshotError::corrupted(
                id,
                format!(
                    "restored files do not match checksum file (expected {:08x}, computed {:08x})",
                    expected.combined_value(),
                    actual.combined_value()
                ),
            ));
        }
        let metadata = read_metadata(id, directory)?;
        Ok((actual, metadata))
    }
}

/// Copy the data files of one snapshot directory into another
///
/// The metadata file is skipped; the target snapshot writes its own.
pub fn copy_snapshot_files(source: &Path, target: &Path) -> std::io::Result<()> {
    for name in list_file_names(source)? {
        if !is_metadata_file(&name) {
            fs::copy(source.join(&name), target.join(&name))?;
        }
    }
    Ok(())
}

/// Read the metadata file of a snapshot directory, synthesizing it if absent
pub(crate) fn read_metadata(id: &SnapshotId, directory: &Path) -> Result<SnapshotMetadata> {
    match fs::read(directory.join(METADATA_FILE_NAME)) {
        Ok(bytes) => SnapshotMetadata::decode(id, &bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SnapshotMetadata::for_id(id)),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{write_snapshot_files, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn state(root: &Path) -> (StoreState, Arc<ManualClock>) {
        let config = SnapshotStoreConfig::for_testing(root);
        SnapshotPaths::from_root(root).create_directories().unwrap();
        let clock = Arc::new(ManualClock::new(1_000));
        let state = StoreState::new(
            config,
            clock.clone(),
            Arc::new(CurrentSnapshotSlot::default()),
            BTreeMap::new(),
        );
        (state, clock)
    }

    fn candidate(state: &StoreState, id: &str) -> CommitCandidate {
        let id: SnapshotId = id.parse().unwrap();
        let directory = state.paths().pending_snapshot_dir(&id);
        fs::create_dir_all(&directory).unwrap();
        write_snapshot_files(&directory, &[("data", id.to_string().as_bytes())]);
        let checksum = ChecksumSet::for_directory(&directory, 64).unwrap();
        CommitCandidate {
            metadata: SnapshotMetadata::for_id(&id),
            id,
            directory,
            checksum,
            target: CommitTarget::Main,
        }
    }

    #[derive(Default)]
    struct CountingListener(AtomicUsize);

    impl SnapshotListener for CountingListener {
        fn on_new_snapshot(&self, _snapshot: &Arc<PersistedSnapshot>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_commit_first_snapshot() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let c = candidate(&state, "10-1-100-50");
        let snapshot = state.commit(c).unwrap();

        assert_eq!(state.current().unwrap().id(), snapshot.id());
        assert!(snapshot.path().join("data").exists());
        assert!(snapshot.checksum_path().exists());
        assert!(!state.paths().pending_snapshot_dir(snapshot.id()).exists());
    }

    #[test]
    fn test_commit_newer_evicts_older() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        let second = state.commit(candidate(&state, "20-1-200-60")).unwrap();

        assert_eq!(state.current().unwrap().id(), second.id());
        assert!(first.is_deleted());
        assert!(!first.path().exists());
        assert!(!first.checksum_path().exists());
        assert_eq!(state.available_snapshots().len(), 1);
    }

    #[test]
    fn test_commit_older_keeps_current() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let newer = state.commit(candidate(&state, "20-1-200-60")).unwrap();
        let older = candidate(&state, "10-1-100-50");
        let older_dir = older.directory.clone();

        let result = state.commit(older).unwrap();
        assert_eq!(result.id(), newer.id());
        assert!(!older_dir.exists());
        assert!(newer.path().join("data").exists());
        assert!(!state.paths().snapshot_dir(&"10-1-100-50".parse().unwrap()).exists());
    }

    #[test]
    fn test_commit_same_position_other_broker_keeps_current() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let current = state.commit(candidate(&state, "10-1-100-50-1")).unwrap();
        let result = state.commit(candidate(&state, "10-1-100-50-2")).unwrap();
        assert_eq!(result.id(), current.id());
    }

    #[test]
    fn test_commit_equal_id_is_idempotent() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        let again = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert!(first.path().join("data").exists());
    }

    #[test]
    fn test_reserved_snapshot_survives_eviction() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        let guard = state.reserve(first.id(), ReservationReason::Backup).unwrap();

        state.commit(candidate(&state, "20-1-200-60")).unwrap();
        assert!(!first.is_deleted());
        assert_eq!(state.available_snapshots().len(), 2);
        assert_eq!(state.compaction_bound(), Some(10));

        guard.release();
        state.commit(candidate(&state, "30-1-300-70")).unwrap();
        assert!(first.is_deleted());
        assert_eq!(state.compaction_bound(), Some(30));
    }

    #[test]
    fn test_persisted_reservation_expires() {
        let dir = tempdir().unwrap();
        let (mut state, clock) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        state
            .reserve_persisted(first.id(), 2_000, ReservationReason::ScaleUp)
            .unwrap();

        state.commit(candidate(&state, "20-1-200-60")).unwrap();
        assert!(!first.is_deleted());

        clock.set(2_000);
        state.commit(candidate(&state, "30-1-300-70")).unwrap();
        assert!(first.is_deleted());
        assert!(!state.paths().reservation_path(first.id()).exists());
    }

    #[test]
    fn test_reserve_deleted_snapshot_not_found() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        state.commit(candidate(&state, "20-1-200-60")).unwrap();

        assert!(matches!(
            state.reserve(first.id(), ReservationReason::Backup),
            Err(SnapshotError::NotFound { .. })
        ));
    }

    #[test]
    fn test_commit_removes_orphaned_pending_dirs() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let orphan = state.paths().pending_dir().join("5-1-50-20");
        let newer_orphan = state.paths().pending_dir().join("50-1-500-20");
        let foreign = state.paths().pending_dir().join("not-a-snapshot");
        for d in [&orphan, &newer_orphan, &foreign] {
            fs::create_dir_all(d).unwrap();
        }

        state.commit(candidate(&state, "10-1-100-50")).unwrap();
        assert!(!orphan.exists());
        assert!(newer_orphan.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_listeners_notified() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let listener = Arc::new(CountingListener::default());
        let as_dyn: Arc<dyn SnapshotListener> = listener.clone();
        state.add_listener(as_dyn.clone());

        state.commit(candidate(&state, "10-1-100-50")).unwrap();
        state.commit(candidate(&state, "5-1-50-20")).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        state.remove_listener(&as_dyn);
        state.commit(candidate(&state, "20-1-200-60")).unwrap();
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_all() {
        let dir = tempdir().unwrap();
        let (mut state, _) = state(dir.path());
        let first = state.commit(candidate(&state, "10-1-100-50")).unwrap();
        state
            .reserve_persisted(first.id(), i64::MAX, ReservationReason::Backup)
            .unwrap();
        let _pending = candidate(&state, "20-1-200-60");

        state.delete_all().unwrap();
        assert!(state.current().is_none());
        assert!(state.available_snapshots().is_empty());
        assert_eq!(fs::read_dir(state.paths().snapshots_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(state.paths().pending_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(state.paths().reservations_dir()).unwrap().count(), 0);
    }
}
