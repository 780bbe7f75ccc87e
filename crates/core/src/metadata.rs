//! Snapshot metadata
//!
//! Stored as JSON in [`METADATA_FILE_NAME`] inside the snapshot directory.
//! The file name sorts after every data file, and checksums always fold it in
//! last. Snapshots written before the file existed get metadata synthesized
//! from their id.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SnapshotError};
use crate::id::SnapshotId;

/// Reserved name of the metadata file and of its transfer chunk
pub const METADATA_FILE_NAME: &str = "zeebe.metadata";

/// Current metadata format version
pub const METADATA_VERSION: u32 = 1;

/// Metadata persisted alongside the snapshot files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    /// Format version
    pub version: u32,
    /// Last processed position covered by the snapshot
    pub processed_position: i64,
    /// Last exported position covered by the snapshot
    pub exported_position: i64,
    /// Position of the last follow-up event written while processing
    pub last_followup_event_position: i64,
}

impl SnapshotMetadata {
    /// Create metadata for a freshly taken snapshot
    pub fn new(
        processed_position: i64,
        exported_position: i64,
        last_followup_event_position: i64,
    ) -> Self {
        SnapshotMetadata {
            version: METADATA_VERSION,
            processed_position,
            exported_position,
            last_followup_event_position,
        }
    }

    /// Synthesize metadata for a snapshot that carries none
    pub fn for_id(id: &SnapshotId) -> Self {
        SnapshotMetadata::new(id.processed_position(), id.exported_position(), i64::MAX)
    }

    /// Serialize to the on-disk representation
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| SnapshotError::Write {
            id: String::new(),
            reason: format!("failed to encode metadata: {}", e),
        })
    }

    /// Parse the on-disk representation
    pub fn decode(id: &SnapshotId, bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| {
            SnapshotError::corrupted(id, format!("unreadable {}: {}", METADATA_FILE_NAME, e))
        })
    }
}

/// True if `name` is the reserved metadata file name
pub fn is_metadata_file(name: &str) -> bool {
    name == METADATA_FILE_NAME
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_json_uses_camel_case() {
        let metadata = SnapshotMetadata::new(100, 50, 120);
        let json = String::from_utf8(metadata.encode().unwrap()).unwrap();
        assert!(json.contains("\"processedPosition\":100"));
        assert!(json.contains("\"lastFollowupEventPosition\":120"));
        assert!(json.contains("\"version\":1"));
    }

    #[test]
    fn test_metadata_decode() {
        let id = SnapshotId::new(10, 1, 100, 50, None).unwrap();
        let bytes = br#"{"version":1,"processedPosition":100,"exportedPosition":50,"lastFollowupEventPosition":7}"#;
        let metadata = SnapshotMetadata::decode(&id, bytes).unwrap();
        assert_eq!(metadata, SnapshotMetadata::new(100, 50, 7));
    }

    #[test]
    fn test_metadata_decode_garbage_is_corruption() {
        let id = SnapshotId::new(10, 1, 100, 50, None).unwrap();
        let err = SnapshotMetadata::decode(&id, b"not json").unwrap_err();
        assert!(matches!(err, SnapshotError::Corrupted { .. }));
    }

    #[test]
    fn test_synthesized_metadata() {
        let id = SnapshotId::new(10, 1, 100, 50, None).unwrap();
        let metadata = SnapshotMetadata::for_id(&id);
        assert_eq!(metadata.processed_position, 100);
        assert_eq!(metadata.exported_position, 50);
        assert_eq!(metadata.last_followup_event_position, i64::MAX);
    }

    #[test]
    fn test_metadata_name_sorts_last() {
        for name in ["000001.sst", "CURRENT", "MANIFEST-000004", "OPTIONS-000007", "y.log"] {
            assert!(name < METADATA_FILE_NAME);
        }
    }
}
