//! Testing utilities for the snapshot store
//!
//! - **Manual clock**: deterministic time for reservation expiry
//! - **File helpers**: write, read and damage snapshot files
//! - **Crash harness**: reproduce the on-disk residue of an interrupted commit
//!
//! # Example
//!
//! ```ignore
//! use snapstore_durability::testing::{CrashPoint, simulate_interrupted_commit};
//!
//! simulate_interrupted_commit(&paths, &id, &[("data", b"abc")], CrashPoint::AfterDirectoryMove)?;
//! let store = SnapshotStore::open(config).await?;
//! assert!(!store.paths().snapshot_dir(&id).exists());
//! ```

mod crash_harness;

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::paths::list_file_names;
use crate::reservation::Clock;

pub use crash_harness::{simulate_interrupted_commit, CrashPoint};

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    /// Clock reading `now_millis`
    pub fn new(now_millis: i64) -> Self {
        ManualClock {
            now: AtomicI64::new(now_millis),
        }
    }

    /// Jump to `now_millis`
    pub fn set(&self, now_millis: i64) {
        self.now.store(now_millis, Ordering::SeqCst);
    }

    /// Move forward by `millis`
    pub fn advance(&self, millis: i64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Write `(name, content)` pairs into `dir`
///
/// Panics on I/O errors; meant for test setup.
pub fn write_snapshot_files(dir: &Path, files: &[(&str, &[u8])]) {
    for (name, content) in files {
        if let Err(e) = std::fs::write(dir.join(name), content) {
            panic!("failed to write {}: {}", dir.join(name).display(), e);
        }
    }
}

/// Read every regular file directly inside `dir`
pub fn read_snapshot_files(dir: &Path) -> io::Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();
    for name in list_file_names(dir)? {
        let content = std::fs::read(dir.join(&name))?;
        files.insert(name, content);
    }
    Ok(files)
}

/// Invert one byte of a file in place
pub fn flip_byte(path: &Path, offset: u64) -> io::Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    byte[0] = !byte[0];
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&byte)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(10);
        clock.advance(5);
        assert_eq!(clock.now_millis(), 15);
        clock.set(1);
        assert_eq!(clock.now_millis(), 1);
    }

    #[test]
    fn test_flip_byte() {
        let dir = tempdir().unwrap();
        write_snapshot_files(dir.path(), &[("f", &[0x0f, 0x00])]);
        flip_byte(&dir.path().join("f"), 1).unwrap();

        let files = read_snapshot_files(dir.path()).unwrap();
        assert_eq!(files["f"], vec![0x0f, 0xff]);
    }
}
