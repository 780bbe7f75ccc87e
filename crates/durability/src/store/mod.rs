//! Snapshot store of one partition
//!
//! [`SnapshotStore`] is the entry point of the crate. Opening a store runs
//! startup recovery, then starts the serialized context every mutation goes
//! through. Handles are cheap to clone and share that context.
//!
//! # Example
//!
//! ```ignore
//! use snapstore_durability::{SnapshotStore, SnapshotStoreConfig};
//!
//! let store = SnapshotStore::open(SnapshotStoreConfig::new("/data/partition-1")).await?;
//! let transient = store.new_transient_snapshot(10, 1, 100, 50, false).await?;
//! transient
//!     .take(|dir| std::fs::write(dir.join("state.db"), b"..."))
//!     .await?;
//! let persisted = transient.persist().await?;
//! assert_eq!(store.latest_snapshot().unwrap().id(), persisted.id());
//! ```
//!
//! # Reads
//!
//! [`SnapshotStore::latest_snapshot`] and [`SnapshotStore::has_snapshot_id`]
//! read a shared reference and never wait on the serialized context.

pub(crate) mod actor;
mod recovery;
mod slot;
pub(crate) mod state;

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use snapstore_core::{Reservation, ReservationReason, Result, SnapshotError, SnapshotId};
use tracing::info;
use uuid::Uuid;

use crate::chunk_reader::SnapshotChunkReader;
use crate::config::SnapshotStoreConfig;
use crate::paths::SnapshotPaths;
use crate::persisted::PersistedSnapshot;
use crate::received::ReceivedSnapshot;
use crate::reservation::{Clock, SnapshotReservation, SystemClock};
use crate::transient::TransientSnapshot;

use self::actor::StoreActor;
use self::slot::CurrentSnapshotSlot;
use self::state::StoreState;

pub use self::recovery::RecoveryReport;
pub use self::state::copy_snapshot_files;

/// Notified after a new snapshot becomes current
///
/// Called on the store's serialized context; implementations should return
/// quickly.
pub trait SnapshotListener: Send + Sync {
    /// A snapshot was committed and is now current
    fn on_new_snapshot(&self, snapshot: &Arc<PersistedSnapshot>);
}

/// Snapshot store of one partition
#[derive(Clone)]
pub struct SnapshotStore {
    actor: StoreActor,
    current: Arc<CurrentSnapshotSlot>,
    paths: SnapshotPaths,
    config: Arc<SnapshotStoreConfig>,
    report: Arc<RecoveryReport>,
}

impl SnapshotStore {
    /// Recover the partition root and start the store
    ///
    /// Must be called from within a tokio runtime.
    pub async fn open(config: SnapshotStoreConfig) -> Result<Self> {
        Self::open_with_clock(config, Arc::new(SystemClock)).await
    }

    /// Like [`SnapshotStore::open`] with a custom clock for reservation expiry
    pub async fn open_with_clock(config: SnapshotStoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| SnapshotError::Config(e.to_string()))?;

        let recovery_config = config.clone();
        let recovery_clock = Arc::clone(&clock);
        let recovered = tokio::task::spawn_blocking(move || {
            recovery::recover(&recovery_config, &recovery_clock)
        })
        .await
        .map_err(|e| SnapshotError::Io(io::Error::new(io::ErrorKind::Other, e)))??;

        let current = Arc::new(CurrentSnapshotSlot::new(recovered.current));
        let paths = SnapshotPaths::from_root(&config.root);
        let state = StoreState::new(
            config.clone(),
            clock,
            Arc::clone(&current),
            recovered.available,
        );
        let actor = StoreActor::spawn(state);

        info!(
            target: "snapstore::store",
            partition = config.partition_id,
            root = %config.root.display(),
            current = ?recovered.report.current.as_ref().map(|id| id.to_string()),
            "Opened snapshot store"
        );

        Ok(SnapshotStore {
            actor,
            current,
            paths,
            config: Arc::new(config),
            report: Arc::new(recovered.report),
        })
    }

    /// What startup recovery found
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.report
    }

    /// Store configuration
    pub fn config(&self) -> &SnapshotStoreConfig {
        &self.config
    }

    /// Partition root directory
    pub fn path(&self) -> &Path {
        self.paths.root()
    }

    /// Directory layout below the partition root
    pub fn paths(&self) -> &SnapshotPaths {
        &self.paths
    }

    /// Current snapshot, if any
    pub fn latest_snapshot(&self) -> Option<Arc<PersistedSnapshot>> {
        self.current.load()
    }

    /// True if the current snapshot has exactly this id
    pub fn has_snapshot_id(&self, id: &SnapshotId) -> bool {
        self.current.load().is_some_and(|s| s.id() == id)
    }

    /// Open a chunk reader over `snapshot` using the configured chunk size
    pub fn new_chunk_reader(&self, snapshot: &PersistedSnapshot) -> Result<SnapshotChunkReader> {
        snapshot.new_chunk_reader(self.config.max_chunk_size)
    }

    /// Snapshots not yet deleted: the current one plus reserved older ones
    pub async fn available_snapshots(&self) -> Result<Vec<Arc<PersistedSnapshot>>> {
        self.actor.call(|state| state.available_snapshots()).await
    }

    /// Lowest index among available snapshots, up to which the log may be compacted
    pub async fn compaction_bound(&self) -> Result<Option<u64>> {
        self.actor.call(|state| state.compaction_bound()).await
    }

    /// Start taking a snapshot locally
    ///
    /// Fails with `AlreadyExists` if the current snapshot has the same
    /// position, unless `force` is set.
    pub async fn new_transient_snapshot(
        &self,
        index: u64,
        term: u64,
        processed_position: i64,
        exported_position: i64,
        force: bool,
    ) -> Result<TransientSnapshot> {
        let actor = self.actor.clone();
        self.actor
            .try_call(move |state| {
                state.new_transient(actor, index, term, processed_position, exported_position, force)
            })
            .await
    }

    /// Start, or resume, receiving a snapshot from another replica
    pub async fn new_received_snapshot(&self, snapshot_id: &str) -> Result<ReceivedSnapshot> {
        let actor = self.actor.clone();
        let snapshot_id = snapshot_id.to_string();
        self.actor
            .try_call(move |state| state.new_received(actor, &snapshot_id))
            .await
    }

    /// Copy the current snapshot into the bootstrap slot
    pub async fn copy_for_bootstrap(&self) -> Result<Arc<PersistedSnapshot>> {
        self.copy_for_bootstrap_with(copy_snapshot_files).await
    }

    /// Like [`SnapshotStore::copy_for_bootstrap`] with a custom file copier
    ///
    /// `copier` receives the current snapshot directory and the empty
    /// bootstrap directory.
    pub async fn copy_for_bootstrap_with<F>(&self, copier: F) -> Result<Arc<PersistedSnapshot>>
    where
        F: FnOnce(&Path, &Path) -> io::Result<()> + Send + 'static,
    {
        self.actor
            .try_call(move |state| state.copy_for_bootstrap(copier))
            .await
    }

    /// Bootstrap snapshot, if one was copied
    pub async fn bootstrap_snapshot(&self) -> Result<Option<Arc<PersistedSnapshot>>> {
        self.actor.call(|state| state.bootstrap_snapshot()).await
    }

    /// Delete the bootstrap snapshot
    pub async fn delete_bootstrap_snapshots(&self) -> Result<()> {
        self.actor
            .try_call(|state| state.delete_bootstrap_snapshots())
            .await
    }

    /// Install a snapshot from backup files
    ///
    /// `files` maps file names to source paths, including the snapshot's
    /// checksum file. Only valid while the store holds no snapshot.
    pub async fn restore(
        &self,
        snapshot_id: &str,
        files: BTreeMap<String, PathBuf>,
    ) -> Result<Arc<PersistedSnapshot>> {
        let id: SnapshotId = snapshot_id.parse()?;
        self.actor
            .try_call(move |state| state.restore(id, files))
            .await
    }

    /// Hold a snapshot in memory until the returned guard is released
    pub async fn reserve(
        &self,
        id: &SnapshotId,
        reason: ReservationReason,
    ) -> Result<SnapshotReservation> {
        let id = id.clone();
        self.actor
            .try_call(move |state| state.reserve(&id, reason))
            .await
    }

    /// Hold a snapshot until `valid_until` (epoch millis), across restarts
    pub async fn reserve_persisted(
        &self,
        id: &SnapshotId,
        valid_until: i64,
        reason: ReservationReason,
    ) -> Result<Reservation> {
        let id = id.clone();
        self.actor
            .try_call(move |state| state.reserve_persisted(&id, valid_until, reason))
            .await
    }

    /// Drop a persisted hold; returns false if it did not exist
    pub async fn remove_persisted_reservation(&self, id: &SnapshotId, reservation: Uuid) -> Result<bool> {
        let id = id.clone();
        self.actor
            .try_call(move |state| state.remove_persisted_reservation(&id, reservation))
            .await
    }

    /// Abort every pending snapshot and empty `pending/`
    pub async fn purge_pending_snapshots(&self) -> Result<()> {
        self.actor
            .try_call(|state| state.purge_pending_snapshots())
            .await
    }

    /// Delete every snapshot, pending snapshot and reservation
    pub async fn delete(&self) -> Result<()> {
        self.actor.try_call(|state| state.delete_all()).await
    }

    /// Register a listener for newly committed snapshots
    pub async fn add_listener(&self, listener: Arc<dyn SnapshotListener>) -> Result<()> {
        self.actor
            .call(move |state| state.add_listener(listener))
            .await
    }

    /// Unregister a listener previously added
    pub async fn remove_listener(&self, listener: &Arc<dyn SnapshotListener>) -> Result<()> {
        let listener = Arc::clone(listener);
        self.actor
            .call(move |state| state.remove_listener(&listener))
            .await
    }

    /// Stop the serialized context; later calls fail with `Closed`
    pub async fn close(&self) {
        self.actor.close().await;
    }
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("partition_id", &self.config.partition_id)
            .field("root", &self.paths.root())
            .field("current", &self.latest_snapshot().map(|s| s.id().to_string()))
            .finish()
    }
}
