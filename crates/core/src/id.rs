//! Snapshot identifiers
//!
//! A snapshot is identified by the log position it captures:
//!
//! ```text
//! index-term-processedPosition-exportedPosition[-brokerId]
//! ```
//!
//! The broker id suffix is optional when parsing so that directories written
//! before it existed still load.
//!
//! # Ordering
//!
//! Recency is the lexicographic order of `(index, term, processed, exported)`,
//! exposed as [`SnapshotPosition`]. The broker id only disambiguates two
//! replicas that produced the same logical snapshot, so it takes part in
//! equality but never in ordering. `SnapshotId` therefore does not implement
//! `Ord`; compare [`SnapshotId::position`] instead.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SnapshotError;

/// Suffix of the commit marker written next to a snapshot directory
pub const CHECKSUM_SUFFIX: &str = ".checksum";

/// Ordered log position of a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotPosition {
    /// Log index
    pub index: u64,
    /// Raft term
    pub term: u64,
    /// Last processed record position
    pub processed_position: i64,
    /// Last exported record position
    pub exported_position: i64,
}

/// Identifier of a snapshot
///
/// Serializes as its canonical string form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId {
    index: u64,
    term: u64,
    processed_position: i64,
    exported_position: i64,
    broker_id: Option<u32>,
}

impl SnapshotId {
    /// Create a new snapshot id
    ///
    /// Positions must be non-negative so the id survives a round trip
    /// through its directory name.
    pub fn new(
        index: u64,
        term: u64,
        processed_position: i64,
        exported_position: i64,
        broker_id: Option<u32>,
    ) -> Result<Self, SnapshotError> {
        if processed_position < 0 || exported_position < 0 {
            return Err(SnapshotError::InvalidId(format!(
                "{}-{}-{}-{}: positions must not be negative",
                index, term, processed_position, exported_position
            )));
        }
        Ok(SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
            broker_id,
        })
    }

    /// Log index
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Raft term
    pub fn term(&self) -> u64 {
        self.term
    }

    /// Last processed position
    pub fn processed_position(&self) -> i64 {
        self.processed_position
    }

    /// Last exported position
    pub fn exported_position(&self) -> i64 {
        self.exported_position
    }

    /// Broker that produced the snapshot, if recorded
    pub fn broker_id(&self) -> Option<u32> {
        self.broker_id
    }

    /// The ordered position of this snapshot
    pub fn position(&self) -> SnapshotPosition {
        SnapshotPosition {
            index: self.index,
            term: self.term,
            processed_position: self.processed_position,
            exported_position: self.exported_position,
        }
    }

    /// True if this snapshot's position is strictly after `other`'s
    pub fn is_newer_than(&self, other: &SnapshotId) -> bool {
        self.position() > other.position()
    }

    /// Id used for the isolated bootstrap copy of this snapshot
    ///
    /// Index and term are zeroed; positions and broker are kept.
    pub fn bootstrap_id(&self) -> SnapshotId {
        SnapshotId {
            index: 0,
            term: 0,
            ..self.clone()
        }
    }

    /// Name of the snapshot directory
    pub fn directory_name(&self) -> String {
        self.to_string()
    }

    /// Name of the checksum file that marks this snapshot as committed
    pub fn checksum_file_name(&self) -> String {
        format!("{}{}", self, CHECKSUM_SUFFIX)
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}-{}-{}-{}",
            self.index, self.term, self.processed_position, self.exported_position
        )?;
        if let Some(broker_id) = self.broker_id {
            write!(f, "-{}", broker_id)?;
        }
        Ok(())
    }
}

impl FromStr for SnapshotId {
    type Err = SnapshotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || SnapshotError::InvalidId(s.to_string());
        let parts: Vec<&str> = s.split('-').collect();
        if !(parts.len() == 4 || parts.len() == 5) {
            return Err(invalid());
        }
        if parts
            .iter()
            .any(|p| p.is_empty() || !p.bytes().all(|b| b.is_ascii_digit()))
        {
            return Err(invalid());
        }

        let index = parts[0].parse().map_err(|_| invalid())?;
        let term = parts[1].parse().map_err(|_| invalid())?;
        let processed_position = parts[2].parse().map_err(|_| invalid())?;
        let exported_position = parts[3].parse().map_err(|_| invalid())?;
        let broker_id = match parts.get(4) {
            Some(b) => Some(b.parse().map_err(|_| invalid())?),
            None => None,
        };

        Ok(SnapshotId {
            index,
            term,
            processed_position,
            exported_position,
            broker_id,
        })
    }
}

impl TryFrom<String> for SnapshotId {
    type Error = SnapshotError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.to_string()
    }
}

/// Parse a snapshot id from a directory name, `None` for foreign names
pub fn parse_snapshot_id(name: &str) -> Option<SnapshotId> {
    name.parse().ok()
}

/// Parse a snapshot id from a checksum file name (`<id>.checksum`)
pub fn parse_checksum_file_name(name: &str) -> Option<SnapshotId> {
    name.strip_suffix(CHECKSUM_SUFFIX)
        .and_then(parse_snapshot_id)
}
