//! Startup recovery of a snapshot store
//!
//! Rebuilds the in-memory view of a partition root after a restart or crash.
//!
//! ## Recovery Sequence
//!
//! 1. Create the directory structure, purge `pending/` and `bootstrap-snapshots/`
//! 2. Scan `snapshots/`: a directory without a checksum file is crash residue
//!    and is deleted; a directory whose recomputed checksum disagrees with its
//!    checksum file is corrupted and is deleted
//! 3. The newest valid snapshot becomes current
//! 4. Older snapshots survive only while a persisted reservation holds them
//! 5. Orphaned checksum, temporary and reservation files are deleted
//!
//! Names that do not parse as snapshot ids are logged and left alone.
//! Corruption never fails recovery; an unreadable reservation file does.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;

use snapstore_core::{
    parse_checksum_file_name, parse_snapshot_id, Result, SnapshotId, CHECKSUM_SUFFIX,
};
use tracing::{debug, info, warn};

use crate::checksum::ChecksumSet;
use crate::config::SnapshotStoreConfig;
use crate::paths::{
    clear_dir, remove_dir_if_exists, remove_file_if_exists, SnapshotPaths, RESERVATION_SUFFIX,
    TMP_SUFFIX,
};
use crate::persisted::PersistedSnapshot;
use crate::reservation::{Clock, ReservationStore};

use super::state::read_metadata;

// ============================================================================
// Recovery Report
// ============================================================================

/// What startup recovery found and did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Snapshot that became current, if any
    pub current: Option<SnapshotId>,
    /// Valid snapshots found, including the current one
    pub recovered: usize,
    /// Snapshots rejected because their files disagree with the checksum file
    pub corrupted: usize,
    /// Snapshot directories without a checksum file (interrupted commits)
    pub incomplete: usize,
    /// Valid but superseded snapshots deleted
    pub deleted: usize,
    /// Entries with names that are not snapshot ids
    pub ignored: usize,
    /// Entries purged from `pending/` and `bootstrap-snapshots/`
    pub purged_pending: usize,
}

impl RecoveryReport {
    /// Human-readable summary
    pub fn summary(&self) -> String {
        let current = match &self.current {
            Some(id) => format!("current snapshot {}", id),
            None => "no snapshot".to_string(),
        };
        format!(
            "Recovery complete: {} valid, {} corrupted, {} incomplete, {} deleted, {} ignored, {} pending purged ({})",
            self.recovered,
            self.corrupted,
            self.incomplete,
            self.deleted,
            self.ignored,
            self.purged_pending,
            current
        )
    }

    /// True if anything on disk had to be discarded as damaged
    pub fn has_issues(&self) -> bool {
        self.corrupted > 0 || self.incomplete > 0
    }
}

// ============================================================================
// Recovery
// ============================================================================

/// Outcome of recovery handed to the store
pub(crate) struct Recovered {
    pub(crate) current: Option<Arc<PersistedSnapshot>>,
    pub(crate) available: BTreeMap<String, Arc<PersistedSnapshot>>,
    pub(crate) report: RecoveryReport,
}

/// Scan a partition root and rebuild the available snapshots
pub(crate) fn recover(config: &SnapshotStoreConfig, clock: &Arc<dyn Clock>) -> Result<Recovered> {
    let paths = SnapshotPaths::from_root(&config.root);
    paths.create_directories()?;
    let mut report = RecoveryReport {
        purged_pending: clear_dir(&paths.pending_dir())? + clear_dir(&paths.bootstrap_dir())?,
        ..RecoveryReport::default()
    };

    let mut directories: BTreeMap<String, SnapshotId> = BTreeMap::new();
    let mut checksum_files: BTreeSet<String> = BTreeSet::new();

    for entry in fs::read_dir(paths.snapshots_dir())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if entry.file_type()?.is_dir() {
            match parse_snapshot_id(&name) {
                Some(id) => {
                    directories.insert(name, id);
                }
                None => {
                    warn!(target: "snapstore::recovery", path = %path.display(), "Ignoring directory that is not a snapshot");
                    report.ignored += 1;
                }
            }
        } else if name.ends_with(TMP_SUFFIX) {
            debug!(target: "snapstore::recovery", path = %path.display(), "Removing temporary file");
            remove_file_if_exists(&path)?;
        } else if let Some(id) = parse_checksum_file_name(&name) {
            checksum_files.insert(id.directory_name());
        } else {
            warn!(target: "snapstore::recovery", path = %path.display(), "Ignoring file that is not a checksum file");
            report.ignored += 1;
        }
    }

    let directory_names: BTreeSet<String> = directories.keys().cloned().collect();
    for name in checksum_files.difference(&directory_names) {
        let path = paths.snapshots_dir().join(format!("{}{}", name, CHECKSUM_SUFFIX));
        debug!(target: "snapstore::recovery", path = %path.display(), "Removing orphaned checksum file");
        remove_file_if_exists(&path)?;
    }

    let mut valid: Vec<Arc<PersistedSnapshot>> = Vec::new();
    for (name, id) in directories {
        let directory = paths.snapshot_dir(&id);
        if !checksum_files.contains(&name) {
            warn!(target: "snapstore::recovery", snapshot = %id, "Deleting snapshot without checksum file, commit was interrupted");
            remove_dir_if_exists(&directory)?;
            remove_file_if_exists(&paths.reservation_path(&id))?;
            report.incomplete += 1;
            continue;
        }

        match verify_snapshot(&paths, &id, config.checksum_block_size) {
            Ok((checksum, metadata)) => {
                let reservations = ReservationStore::load(
                    id.clone(),
                    paths.reservation_path(&id),
                    config.sync_on_commit,
                )?;
                valid.push(Arc::new(PersistedSnapshot::new(
                    id.clone(),
                    directory,
                    paths.checksum_path(&id),
                    checksum,
                    metadata,
                    Arc::new(reservations),
                    Arc::clone(clock),
                )));
            }
            Err(reason) => {
                warn!(target: "snapstore::recovery", snapshot = %id, %reason, "Deleting corrupted snapshot");
                remove_file_if_exists(&paths.checksum_path(&id))?;
                remove_dir_if_exists(&directory)?;
                remove_file_if_exists(&paths.reservation_path(&id))?;
                report.corrupted += 1;
            }
        }
    }
    report.recovered = valid.len();

    let current = valid
        .iter()
        .max_by_key(|s| {
            (
                s.id().position(),
                s.id().broker_id() == config.broker_id,
                s.id().to_string(),
            )
        })
        .cloned();

    let now = clock.now_millis();
    let mut available = BTreeMap::new();
    for snapshot in valid {
        let is_current = current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &snapshot));
        if is_current || snapshot.reservations().is_reserved(now) {
            available.insert(snapshot.id().to_string(), snapshot);
        } else {
            debug!(target: "snapstore::recovery", snapshot = %snapshot.id(), "Deleting superseded snapshot");
            snapshot.delete(config.sync_on_commit)?;
            report.deleted += 1;
        }
    }

    remove_orphaned_reservations(&paths, &available)?;

    report.current = current.as_ref().map(|c| c.id().clone());
    info!(target: "snapstore::recovery", partition = config.partition_id, "{}", report.summary());

    Ok(Recovered {
        current,
        available,
        report,
    })
}

/// Recompute a snapshot's checksum and compare it with its checksum file
fn verify_snapshot(
    paths: &SnapshotPaths,
    id: &SnapshotId,
    block_size: usize,
) -> std::result::Result<(ChecksumSet, snapstore_core::SnapshotMetadata), String> {
    let stored = ChecksumSet::read_file(&paths.checksum_path(id))
        .map_err(|e| format!("unreadable checksum file: {}", e))?;
    let directory = paths.snapshot_dir(id);
    let actual = ChecksumSet::for_directory(&directory, block_size)
        .map_err(|e| format!("cannot checksum files: {}", e))?;

    if !actual.matches(&stored) {
        return Err(format!(
            "checksum mismatch (stored {:08x}, computed {:08x})",
            stored.combined_value(),
            actual.combined_value()
        ));
    }

    let metadata = read_metadata(id, &directory).map_err(|e| e.to_string())?;
    Ok((actual, metadata))
}

fn remove_orphaned_reservations(
    paths: &SnapshotPaths,
    available: &BTreeMap<String, Arc<PersistedSnapshot>>,
) -> Result<()> {
    for entry in fs::read_dir(paths.reservations_dir())? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        let keep = name
            .strip_suffix(RESERVATION_SUFFIX)
            .is_some_and(|id| available.contains_key(id));
        if !keep && entry.file_type()?.is_file() {
            debug!(target: "snapstore::recovery", file = %name, "Removing orphaned reservation file");
            remove_file_if_exists(&entry.path())?;
        }
    }
    Ok(())
}
