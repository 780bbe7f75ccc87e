//! Snapshot transfer chunks
//!
//! A chunk is a bounded slice of one snapshot file. The replication layer
//! moves chunks between replicas; this crate only defines their shape.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One unit of snapshot transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotChunk {
    /// Canonical id string of the snapshot the chunk belongs to
    pub snapshot_id: String,
    /// Number of files in the snapshot
    pub total_count: u32,
    /// File the content belongs to
    pub chunk_name: String,
    /// CRC32C of `content`
    pub checksum: u64,
    /// Combined checksum of the whole source snapshot
    pub snapshot_checksum: u64,
    /// Raw bytes
    pub content: Vec<u8>,
    /// Offset of `content` within the file
    pub file_block_position: u64,
    /// Size of the complete file
    pub total_file_size: u64,
}

impl SnapshotChunk {
    /// Id of this chunk, usable to resume a transfer
    pub fn id(&self) -> ChunkId {
        ChunkId::new(self.chunk_name.clone(), self.file_block_position)
    }

    /// Offset just past `content`, or `None` if it overflows
    pub fn end_position(&self) -> Option<u64> {
        self.file_block_position
            .checked_add(self.content.len() as u64)
    }

    /// True if this chunk carries the last bytes of its file
    pub fn completes_file(&self) -> bool {
        self.end_position()
            .map_or(true, |end| end >= self.total_file_size)
    }
}

/// Position of a chunk within a snapshot: a file and a byte offset in it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkId {
    /// File name
    pub file_name: String,
    /// Byte offset in the file
    pub offset: u64,
}

impl ChunkId {
    /// Create a chunk id
    pub fn new(file_name: impl Into<String>, offset: u64) -> Self {
        ChunkId {
            file_name: file_name.into(),
            offset,
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.file_name, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(position: u64, len: usize, total: u64) -> SnapshotChunk {
        SnapshotChunk {
            snapshot_id: "1-1-1-1".to_string(),
            total_count: 1,
            chunk_name: "data".to_string(),
            checksum: 0,
            snapshot_checksum: 0,
            content: vec![0; len],
            file_block_position: position,
            total_file_size: total,
        }
    }

    #[test]
    fn test_completes_file() {
        assert!(!chunk(0, 4, 8).completes_file());
        assert!(chunk(4, 4, 8).completes_file());
        assert!(chunk(0, 0, 0).completes_file());
        assert!(chunk(u64::MAX, 4, u64::MAX).completes_file());
        assert_eq!(chunk(u64::MAX, 4, u64::MAX).end_position(), None);
        assert_eq!(chunk(4, 4, 8).end_position(), Some(8));
    }

    #[test]
    fn test_chunk_id() {
        let id = chunk(4, 4, 8).id();
        assert_eq!(id, ChunkId::new("data", 4));
        assert_eq!(id.to_string(), "data@4");
    }

    #[test]
    fn test_chunk_json_field_names() {
        let json = serde_json::to_string(&chunk(0, 1, 1)).unwrap();
        assert!(json.contains("\"snapshotId\""));
        assert!(json.contains("\"fileBlockPosition\""));
        assert!(json.contains("\"totalFileSize\""));
    }
}
