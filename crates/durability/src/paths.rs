//! Snapshot store directory structure
//!
//! One store owns one partition root:
//!
//! ```text
//! partition-1/
//! ├── snapshots/              # Committed snapshots
//! │   ├── 10-1-100-50/        # Snapshot files + zeebe.metadata
//! │   └── 10-1-100-50.checksum  # Commit marker
//! ├── pending/                # In-progress transient/received snapshots
//! │   └── 20-1-200-60/
//! ├── bootstrap-snapshots/    # Isolated copy used to seed a new replica
//! │   ├── 0-0-100-50/
//! │   └── 0-0-100-50.checksum
//! └── reservations/           # Persisted reservations
//!     └── 10-1-100-50.bin
//! ```
//!
//! Only the store's serialized context creates, renames or deletes entries
//! below the root.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use snapstore_core::SnapshotId;

/// Suffix of checksum files being written, before the commit rename
pub const TMP_SUFFIX: &str = ".tmp";

/// Suffix of persisted reservation files
pub const RESERVATION_SUFFIX: &str = ".bin";

/// Snapshot store paths
#[derive(Debug, Clone)]
pub struct SnapshotPaths {
    root: PathBuf,
}

impl SnapshotPaths {
    /// Create paths from the partition root directory
    pub fn from_root(root: impl AsRef<Path>) -> Self {
        SnapshotPaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Partition root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding committed snapshots and their checksum files
    pub fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    /// Directory holding in-progress snapshots
    pub fn pending_dir(&self) -> PathBuf {
        self.root.join("pending")
    }

    /// Directory holding the bootstrap snapshot
    pub fn bootstrap_dir(&self) -> PathBuf {
        self.root.join("bootstrap-snapshots")
    }

    /// Directory holding persisted reservation files
    pub fn reservations_dir(&self) -> PathBuf {
        self.root.join("reservations")
    }

    /// Directory of a committed snapshot
    pub fn snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.directory_name())
    }

    /// Commit marker of a committed snapshot
    pub fn checksum_path(&self, id: &SnapshotId) -> PathBuf {
        self.snapshots_dir().join(id.checksum_file_name())
    }

    /// Working directory of an in-progress snapshot
    pub fn pending_snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.pending_dir().join(id.directory_name())
    }

    /// Directory of a bootstrap snapshot
    pub fn bootstrap_snapshot_dir(&self, id: &SnapshotId) -> PathBuf {
        self.bootstrap_dir().join(id.directory_name())
    }

    /// Commit marker of a bootstrap snapshot
    pub fn bootstrap_checksum_path(&self, id: &SnapshotId) -> PathBuf {
        self.bootstrap_dir().join(id.checksum_file_name())
    }

    /// Persisted reservations of a snapshot
    pub fn reservation_path(&self, id: &SnapshotId) -> PathBuf {
        self.reservations_dir()
            .join(format!("{}{}", id.directory_name(), RESERVATION_SUFFIX))
    }

    /// Create the full directory structure
    pub fn create_directories(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.snapshots_dir())?;
        std::fs::create_dir_all(self.pending_dir())?;
        std::fs::create_dir_all(self.bootstrap_dir())?;
        std::fs::create_dir_all(self.reservations_dir())?;
        Ok(())
    }
}

/// Path of the temporary file a marker is written to before its rename
pub fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(TMP_SUFFIX);
    PathBuf::from(name)
}

/// fsync a directory so renames and deletes inside it are durable
pub fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

/// fsync every regular file directly inside `dir`, then `dir` itself
pub fn sync_dir_contents(dir: &Path) -> io::Result<()> {
    for name in list_file_names(dir)? {
        File::open(dir.join(name))?.sync_all()?;
    }
    sync_dir(dir)
}

/// Remove a directory tree, treating a missing directory as success
pub fn remove_dir_if_exists(dir: &Path) -> io::Result<()> {
    match std::fs::remove_dir_all(dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove a file, treating a missing file as success
pub fn remove_file_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Remove every entry below `dir`, keeping `dir` itself
pub fn clear_dir(dir: &Path) -> io::Result<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut count = 0;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_dir_if_exists(&entry.path())?;
        } else {
            remove_file_if_exists(&entry.path())?;
        }
        count += 1;
    }
    Ok(count)
}

/// Names of the regular files directly inside `dir`
pub fn list_file_names(dir: &Path) -> io::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(names)
}

/// True if `name` is a plain file name that stays inside its directory
pub fn is_safe_file_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains('\0')
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_safe_file_names() {
        for name in ["000001.sst", "CURRENT", "zeebe.metadata", "..data"] {
            assert!(is_safe_file_name(name), "{:?} rejected", name);
        }
        for name in ["", ".", "..", "../x", "a/b", "a\\b", "a\0b"] {
            assert!(!is_safe_file_name(name), "{:?} accepted", name);
        }
    }

    #[test]
    fn test_paths_from_root() {
        let paths = SnapshotPaths::from_root("/data/partition-1");
        let id: SnapshotId = "10-1-100-50".parse().unwrap();

        assert_eq!(paths.snapshots_dir(), PathBuf::from("/data/partition-1/snapshots"));
        assert_eq!(
            paths.snapshot_dir(&id),
            PathBuf::from("/data/partition-1/snapshots/10-1-100-50")
        );
        assert_eq!(
            paths.checksum_path(&id),
            PathBuf::from("/data/partition-1/snapshots/10-1-100-50.checksum")
        );
        assert_eq!(
            paths.pending_snapshot_dir(&id),
            PathBuf::from("/data/partition-1/pending/10-1-100-50")
        );
        assert_eq!(
            paths.reservation_path(&id),
            PathBuf::from("/data/partition-1/reservations/10-1-100-50.bin")
        );
    }

    #[test]
    fn test_tmp_path() {
        let path = PathBuf::from("/a/10-1-100-50.checksum");
        assert_eq!(tmp_path(&path), PathBuf::from("/a/10-1-100-50.checksum.tmp"));
    }

    #[test]
    fn test_create_directories() {
        let dir = tempdir().unwrap();
        let paths = SnapshotPaths::from_root(dir.path().join("partition-1"));
        paths.create_directories().unwrap();

        assert!(paths.snapshots_dir().is_dir());
        assert!(paths.pending_dir().is_dir());
        assert!(paths.bootstrap_dir().is_dir());
        assert!(paths.reservations_dir().is_dir());
    }

    #[test]
    fn test_clear_dir_keeps_root() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("a")).unwrap();
        std::fs::write(dir.path().join("a/file"), b"x").unwrap();
        std::fs::write(dir.path().join("b"), b"y").unwrap();

        assert_eq!(clear_dir(dir.path()).unwrap(), 2);
        assert!(dir.path().exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempdir().unwrap();
        remove_dir_if_exists(&dir.path().join("missing")).unwrap();
        remove_file_if_exists(&dir.path().join("missing")).unwrap();
    }
}
