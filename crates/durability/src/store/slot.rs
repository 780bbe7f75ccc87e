//! Published "current snapshot" reference
//!
//! Readers load the reference from any thread without going through the
//! store's task queue. Only the serialized context replaces it, and it does
//! so with a compare-and-swap so an unexpected interleaving is reported
//! instead of silently overwritten.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::persisted::PersistedSnapshot;

/// Single-slot, atomically replaced snapshot reference
#[derive(Debug, Default)]
pub(crate) struct CurrentSnapshotSlot {
    inner: RwLock<Option<Arc<PersistedSnapshot>>>,
}

impl CurrentSnapshotSlot {
    pub(crate) fn new(initial: Option<Arc<PersistedSnapshot>>) -> Self {
        CurrentSnapshotSlot {
            inner: RwLock::new(initial),
        }
    }

    /// Current snapshot, if any
    pub(crate) fn load(&self) -> Option<Arc<PersistedSnapshot>> {
        self.inner.read().clone()
    }

    /// Replace `expected` with `new`
    ///
    /// Fails, returning the value actually found, if the slot no longer holds
    /// `expected`.
    pub(crate) fn compare_and_swap(
        &self,
        expected: Option<&Arc<PersistedSnapshot>>,
        new: Option<Arc<PersistedSnapshot>>,
    ) -> Result<(), Option<Arc<PersistedSnapshot>>> {
        let mut slot = self.inner.write();
        let unchanged = match (slot.as_ref(), expected) {
            (None, None) => true,
            (Some(actual), Some(expected)) => Arc::ptr_eq(actual, expected),
            _ => false,
        };
        if !unchanged {
            return Err(slot.clone());
        }
        *slot = new;
        Ok(())
    }

    /// Unconditionally clear the slot
    pub(crate) fn clear(&self) {
        *self.inner.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ChecksumSet;
    use crate::reservation::{ReservationStore, SystemClock};
    use snapstore_core::{SnapshotId, SnapshotMetadata};
    use std::path::Path;

    fn snapshot(root: &Path, index: u64) -> Arc<PersistedSnapshot> {
        let id = SnapshotId::new(index, 1, index as i64, 0, None).unwrap();
        Arc::new(PersistedSnapshot::new(
            id.clone(),
            root.join(id.directory_name()),
            root.join(id.checksum_file_name()),
            ChecksumSet::new(),
            SnapshotMetadata::for_id(&id),
            Arc::new(ReservationStore::new(id, root.join("r.bin"), false)),
            Arc::new(SystemClock),
        ))
    }

    #[test]
    fn test_swap_from_empty() {
        let dir = tempfile::tempdir().unwrap();
        let slot = CurrentSnapshotSlot::default();
        let first = snapshot(dir.path(), 1);

        slot.compare_and_swap(None, Some(Arc::clone(&first))).unwrap();
        assert!(Arc::ptr_eq(&slot.load().unwrap(), &first));
    }

    #[test]
    fn test_swap_detects_interleaving() {
        let dir = tempfile::tempdir().unwrap();
        let first = snapshot(dir.path(), 1);
        let second = snapshot(dir.path(), 2);
        let slot = CurrentSnapshotSlot::new(Some(Arc::clone(&second)));

        let actual = slot
            .compare_and_swap(Some(&first), Some(snapshot(dir.path(), 3)))
            .unwrap_err();
        assert!(Arc::ptr_eq(&actual.unwrap(), &second));

        // Same id, different instance: still a conflict.
        let lookalike = snapshot(dir.path(), 2);
        assert!(slot.compare_and_swap(Some(&lookalike), None).is_err());

        assert!(slot.compare_and_swap(None, None).is_err());
        slot.clear();
        assert!(slot.load().is_none());
    }
}
