//! Crash harness for the commit procedure
//!
//! A commit moves the working directory from `pending/` into `snapshots/`,
//! writes the checksum file to a temporary path and renames it into place.
//! [`simulate_interrupted_commit`] leaves the files exactly as a process
//! killed at a given [`CrashPoint`] would, so recovery can be tested without
//! killing anything.

use std::fs;
use std::io;

use snapstore_core::{is_metadata_file, SnapshotId};

use crate::checksum::ChecksumSet;
use crate::paths::{tmp_path, SnapshotPaths};

/// Where a commit was interrupted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashPoint {
    /// Files written to `pending/`, nothing moved yet
    BeforeDirectoryMove,
    /// Directory moved into `snapshots/`, no checksum file yet
    AfterDirectoryMove,
    /// Checksum written to its temporary path but not renamed
    AfterChecksumTemp,
    /// Checksum renamed into place; the commit is durable
    AfterChecksumRename,
}

impl CrashPoint {
    /// All crash points in commit order
    pub fn all() -> [CrashPoint; 4] {
        [
            CrashPoint::BeforeDirectoryMove,
            CrashPoint::AfterDirectoryMove,
            CrashPoint::AfterChecksumTemp,
            CrashPoint::AfterChecksumRename,
        ]
    }

    /// True if recovery must find the snapshot committed
    pub fn is_committed(self) -> bool {
        self == CrashPoint::AfterChecksumRename
    }
}

/// Reproduce the on-disk state of a commit of `id` interrupted at `point`
pub fn simulate_interrupted_commit(
    paths: &SnapshotPaths,
    id: &SnapshotId,
    files: &[(&str, &[u8])],
    point: CrashPoint,
) -> io::Result<()> {
    paths.create_directories()?;
    let pending = paths.pending_snapshot_dir(id);
    fs::create_dir_all(&pending)?;
    let mut checksum = ChecksumSet::new();
    let mut ordered: Vec<(&str, &[u8])> = files.to_vec();
    ordered.sort_by(|a, b| (is_metadata_file(a.0), a.0).cmp(&(is_metadata_file(b.0), b.0)));
    for (name, content) in ordered {
        fs::write(pending.join(name), content)?;
        checksum.update_from_bytes(name, content);
    }
    if point == CrashPoint::BeforeDirectoryMove {
        return Ok(());
    }

    let destination = paths.snapshot_dir(id);
    fs::rename(&pending, &destination)?;
    if point == CrashPoint::AfterDirectoryMove {
        return Ok(());
    }

    let checksum_path = paths.checksum_path(id);
    fs::write(tmp_path(&checksum_path), checksum.to_bytes()?)?;
    if point == CrashPoint::AfterChecksumTemp {
        return Ok(());
    }

    fs::rename(tmp_path(&checksum_path), &checksum_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_residue_per_crash_point() {
        let id: SnapshotId = "10-1-100-50".parse().unwrap();
        for point in CrashPoint::all() {
            let dir = tempdir().unwrap();
            let paths = SnapshotPaths::from_root(dir.path());
            simulate_interrupted_commit(&paths, &id, &[("data", b"abc")], point).unwrap();

            let moved = paths.snapshot_dir(&id).exists();
            assert_eq!(paths.pending_snapshot_dir(&id).exists(), !moved);
            assert_eq!(moved, point != CrashPoint::BeforeDirectoryMove);
            assert_eq!(paths.checksum_path(&id).exists(), point.is_committed());
            assert_eq!(
                tmp_path(&paths.checksum_path(&id)).exists(),
                point == CrashPoint::AfterChecksumTemp
            );
        }
    }
}
