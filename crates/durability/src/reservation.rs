//! Snapshot reservations
//!
//! A [`ReservationStore`] tracks the holds on one snapshot. While any hold is
//! active the store's eviction policy never deletes the snapshot, even after
//! a newer one is committed.
//!
//! - **In-memory** holds are handed out as [`SnapshotReservation`] guards.
//!   Releasing (or dropping) the guard removes the hold. Nothing touches disk.
//! - **Persisted** holds carry an expiry and are rewritten to a small binary
//!   file on every change, so they survive restarts.
//!
//! # Persisted format
//!
//! Big-endian:
//!
//! ```text
//! version: u8 (= 1)
//! count:   u32
//! count x { uuid: [u8; 16], valid_until: i64, reason: u8 }
//! ```
//!
//! A file with an unknown version or a short record is an error, never an
//! empty reservation set.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use snapstore_core::{Reservation, ReservationKind, ReservationReason, SnapshotError, SnapshotId};
use tracing::debug;
use uuid::Uuid;

use crate::paths::{remove_file_if_exists, sync_dir, tmp_path};

/// Persisted reservation format version
pub const RESERVATION_FORMAT_VERSION: u8 = 1;

const ENTRY_SIZE: usize = 16 + 8 + 1;

/// Source of the current time for reservation expiry
pub trait Clock: Send + Sync + fmt::Debug {
    /// Milliseconds since the Unix epoch
    fn now_millis(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Holds on one snapshot
#[derive(Debug)]
pub struct ReservationStore {
    snapshot_id: SnapshotId,
    path: PathBuf,
    sync: bool,
    in_memory: Mutex<HashMap<Uuid, Reservation>>,
    persisted: Mutex<BTreeMap<Uuid, Reservation>>,
}

impl ReservationStore {
    /// Create an empty store backed by `path`
    pub fn new(snapshot_id: SnapshotId, path: PathBuf, sync: bool) -> Self {
        ReservationStore {
            snapshot_id,
            path,
            sync,
            in_memory: Mutex::new(HashMap::new()),
            persisted: Mutex::new(BTreeMap::new()),
        }
    }

    /// Load persisted holds from `path`, if the file exists
    pub fn load(snapshot_id: SnapshotId, path: PathBuf, sync: bool) -> Result<Self, ReservationError> {
        let store = ReservationStore::new(snapshot_id, path, sync);
        match std::fs::read(&store.path) {
            Ok(bytes) => {
                let entries = decode_reservations(&bytes).map_err(|e| e.at(&store.path))?;
                let mut persisted = store.persisted.lock();
                for reservation in entries {
                    persisted.insert(reservation.id, reservation);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(store)
    }

    /// Snapshot these holds belong to
    pub fn snapshot_id(&self) -> &SnapshotId {
        &self.snapshot_id
    }

    /// Location of the persisted holds
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Add an in-memory hold, released when the guard is released or dropped
    pub fn in_memory_reservation(self: &Arc<Self>, reason: ReservationReason) -> SnapshotReservation {
        let reservation = Reservation::in_memory(reason);
        self.in_memory.lock().insert(reservation.id, reservation);
        debug!(target: "snapstore::reservation", snapshot = %self.snapshot_id, id = %reservation.id, ?reason, "In-memory reservation added");
        SnapshotReservation {
            reservation,
            store: Arc::clone(self),
            released: false,
        }
    }

    /// Add a persisted hold and rewrite the reservation file
    pub fn persisted_reservation(
        &self,
        valid_until: i64,
        reason: ReservationReason,
    ) -> Result<Reservation, ReservationError> {
        let reservation = Reservation::persisted(valid_until, reason);
        let mut persisted = self.persisted.lock();
        persisted.insert(reservation.id, reservation);
        if let Err(e) = self.write_file(&persisted) {
            persisted.remove(&reservation.id);
            return Err(e);
        }
        debug!(target: "snapstore::reservation", snapshot = %self.snapshot_id, id = %reservation.id, valid_until, ?reason, "Persisted reservation added");
        Ok(reservation)
    }

    /// Remove a persisted hold; returns false if it did not exist
    pub fn remove_persisted(&self, id: Uuid) -> Result<bool, ReservationError> {
        let mut persisted = self.persisted.lock();
        let Some(removed) = persisted.remove(&id) else {
            return Ok(false);
        };
        if let Err(e) = self.write_file(&persisted) {
            persisted.insert(id, removed);
            return Err(e);
        }
        debug!(target: "snapstore::reservation", snapshot = %self.snapshot_id, %id, "Persisted reservation removed");
        Ok(true)
    }

    /// True if any in-memory hold exists or a persisted one is unexpired
    pub fn is_reserved(&self, now_millis: i64) -> bool {
        if !self.in_memory.lock().is_empty() {
            return true;
        }
        self.persisted
            .lock()
            .values()
            .any(|r| r.is_active(now_millis))
    }

    /// All current holds
    pub fn reservations(&self) -> Vec<Reservation> {
        let mut all: Vec<Reservation> = self.in_memory.lock().values().copied().collect();
        all.extend(self.persisted.lock().values().copied());
        all
    }

    /// Delete the reservation file
    pub fn delete_file(&self) -> io::Result<()> {
        remove_file_if_exists(&self.path)
    }

    fn release_in_memory(&self, id: Uuid) {
        if self.in_memory.lock().remove(&id).is_some() {
            debug!(target: "snapstore::reservation", snapshot = %self.snapshot_id, %id, "In-memory reservation released");
        }
    }

    fn write_file(&self, persisted: &BTreeMap<Uuid, Reservation>) -> Result<(), ReservationError> {
        if persisted.is_empty() {
            return Ok(remove_file_if_exists(&self.path)?);
        }

        let bytes = encode_reservations(persisted.values())?;
        let temp_path = tmp_path(&self.path);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)?;
        file.write_all(&bytes)?;
        if self.sync {
            file.sync_all()?;
        }
        drop(file);

        std::fs::rename(&temp_path, &self.path)?;
        if self.sync {
            if let Some(parent) = self.path.parent() {
                sync_dir(parent)?;
            }
        }
        Ok(())
    }
}

/// Guard for an in-memory reservation
///
/// The hold lasts until [`SnapshotReservation::release`] is called or the
/// guard is dropped.
#[derive(Debug)]
pub struct SnapshotReservation {
    reservation: Reservation,
    store: Arc<ReservationStore>,
    released: bool,
}

impl SnapshotReservation {
    /// Reservation details
    pub fn reservation(&self) -> &Reservation {
        &self.reservation
    }

    /// Snapshot held by this reservation
    pub fn snapshot_id(&self) -> &SnapshotId {
        self.store.snapshot_id()
    }

    /// Release the hold
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.store.release_in_memory(self.reservation.id);
            self.released = true;
        }
    }
}

impl Drop for SnapshotReservation {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Encode persisted reservations
pub fn encode_reservations<'a>(
    reservations: impl IntoIterator<Item = &'a Reservation>,
) -> io::Result<Vec<u8>> {
    let reservations: Vec<&Reservation> = reservations.into_iter().collect();
    let mut out = Vec::with_capacity(5 + reservations.len() * ENTRY_SIZE);
    out.write_u8(RESERVATION_FORMAT_VERSION)?;
    out.write_u32::<BigEndian>(reservations.len() as u32)?;
    for reservation in reservations {
        out.write_all(reservation.id.as_bytes())?;
        out.write_i64::<BigEndian>(reservation.valid_until)?;
        out.write_u8(reservation.reason.as_byte())?;
    }
    Ok(out)
}

/// Decode persisted reservations
pub fn decode_reservations(bytes: &[u8]) -> Result<Vec<Reservation>, ReservationError> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u8().map_err(truncated)?;
    if version != RESERVATION_FORMAT_VERSION {
        return Err(ReservationError::UnsupportedVersion {
            path: None,
            version,
        });
    }

    let count = cursor.read_u32::<BigEndian>().map_err(truncated)? as usize;
    let remaining = bytes.len() - cursor.position() as usize;
    if remaining != count * ENTRY_SIZE {
        return Err(ReservationError::Truncated {
            path: None,
            expected: count * ENTRY_SIZE,
            actual: remaining,
        });
    }

    let mut reservations = Vec::with_capacity(count);
    for _ in 0..count {
        let mut uuid = [0u8; 16];
        cursor.read_exact(&mut uuid).map_err(truncated)?;
        let valid_until = cursor.read_i64::<BigEndian>().map_err(truncated)?;
        let tag = cursor.read_u8().map_err(truncated)?;
        let reason = ReservationReason::from_byte(tag).ok_or(ReservationError::InvalidReason(tag))?;
        reservations.push(Reservation {
            id: Uuid::from_bytes(uuid),
            kind: ReservationKind::Persisted,
            reason,
            valid_until,
        });
    }
    Ok(reservations)
}

fn truncated(_: io::Error) -> ReservationError {
    ReservationError::Truncated {
        path: None,
        expected: 0,
        actual: 0,
    }
}

/// Errors reading or writing persisted reservations
#[derive(Debug, thiserror::Error)]
pub enum ReservationError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Reservation file written by an unknown format version
    #[error("Unsupported reservation format version {version} in {path:?}")]
    UnsupportedVersion {
        /// File, when known
        path: Option<PathBuf>,
        /// Version found
        version: u8,
    },

    /// Reservation file shorter or longer than its header announces
    #[error("Truncated reservation file {path:?}: expected {expected} entry bytes, found {actual}")]
    Truncated {
        /// File, when known
        path: Option<PathBuf>,
        /// Entry bytes announced by the header
        expected: usize,
        /// Entry bytes present
        actual: usize,
    },

    /// Unknown reason tag
    #[error("Invalid reservation reason tag {0}")]
    InvalidReason(u8),
}

impl ReservationError {
    fn at(self, file: &Path) -> Self {
        match self {
            ReservationError::UnsupportedVersion { version, .. } => ReservationError::UnsupportedVersion {
                path: Some(file.to_path_buf()),
                version,
            },
            ReservationError::Truncated {
                expected, actual, ..
            } => ReservationError::Truncated {
                path: Some(file.to_path_buf()),
                expected,
                actual,
            },
            other => other,
        }
    }
}

impl From<ReservationError> for SnapshotError {
    fn from(e: ReservationError) -> Self {
        SnapshotError::Reservation(e.to_string())
    }
}
