//! Reservation value types
//!
//! A reservation holds a snapshot against deletion. In-memory reservations die
//! with the process; persisted ones are written next to the snapshot and
//! survive restarts.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Whether a reservation survives restarts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReservationKind {
    /// Held only by the running process
    InMemory,
    /// Written to disk and reloaded on startup
    Persisted,
}

/// Why a snapshot is reserved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReservationReason {
    /// A backup is copying the snapshot
    Backup = 1,
    /// The snapshot seeds a replica added by scale-up
    ScaleUp = 2,
}

impl ReservationReason {
    /// Encoded tag byte
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Decode a tag byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(ReservationReason::Backup),
            2 => Some(ReservationReason::ScaleUp),
            _ => None,
        }
    }
}

/// A hold on one snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reservation {
    /// Unique id of the hold
    pub id: Uuid,
    /// In-memory or persisted
    pub kind: ReservationKind,
    /// Why the hold exists
    pub reason: ReservationReason,
    /// Expiry as milliseconds since the epoch; `i64::MAX` never expires
    pub valid_until: i64,
}

impl Reservation {
    /// New in-memory reservation; these never expire on their own
    pub fn in_memory(reason: ReservationReason) -> Self {
        Reservation {
            id: Uuid::new_v4(),
            kind: ReservationKind::InMemory,
            reason,
            valid_until: i64::MAX,
        }
    }

    /// New persisted reservation valid until `valid_until` (epoch millis)
    pub fn persisted(valid_until: i64, reason: ReservationReason) -> Self {
        Reservation {
            id: Uuid::new_v4(),
            kind: ReservationKind::Persisted,
            reason,
            valid_until,
        }
    }

    /// True if the hold is still in force at `now_millis`
    pub fn is_active(&self, now_millis: i64) -> bool {
        match self.kind {
            ReservationKind::InMemory => true,
            ReservationKind::Persisted => self.valid_until > now_millis,
        }
    }
}
