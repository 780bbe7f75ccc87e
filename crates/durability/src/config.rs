//! Snapshot store configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Smallest chunk size a store accepts
pub const MIN_CHUNK_SIZE: usize = 1024;

/// Snapshot store configuration
///
/// Controls where a partition keeps its snapshots and how they are read and
/// synced.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotStoreConfig {
    /// Partition root directory
    pub root: PathBuf,
    /// Partition this store belongs to, used in log fields
    pub partition_id: u32,
    /// Broker id stamped onto locally taken snapshots
    pub broker_id: Option<u32>,
    /// Maximum content size of one transfer chunk (default: 512KB)
    pub max_chunk_size: usize,
    /// Read block size when checksumming files (default: 64KB)
    pub checksum_block_size: usize,
    /// fsync files and parent directories on commit (default: true)
    pub sync_on_commit: bool,
}

impl Default for SnapshotStoreConfig {
    fn default() -> Self {
        SnapshotStoreConfig {
            root: PathBuf::from("data"),
            partition_id: 1,
            broker_id: None,
            max_chunk_size: 512 * 1024,
            checksum_block_size: 64 * 1024,
            sync_on_commit: true,
        }
    }
}

impl SnapshotStoreConfig {
    /// Create config rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        SnapshotStoreConfig {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Create config for testing
    ///
    /// Uses small chunks so multi-chunk files show up with small payloads.
    pub fn for_testing(root: impl Into<PathBuf>) -> Self {
        SnapshotStoreConfig {
            root: root.into(),
            max_chunk_size: MIN_CHUNK_SIZE,
            checksum_block_size: 256,
            sync_on_commit: false,
            ..Default::default()
        }
    }

    /// Set partition id
    pub fn with_partition_id(mut self, partition_id: u32) -> Self {
        self.partition_id = partition_id;
        self
    }

    /// Set broker id
    pub fn with_broker_id(mut self, broker_id: u32) -> Self {
        self.broker_id = Some(broker_id);
        self
    }

    /// Set maximum chunk size
    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    /// Set checksum read block size
    pub fn with_checksum_block_size(mut self, size: usize) -> Self {
        self.checksum_block_size = size;
        self
    }

    /// Enable or disable fsync on commit
    pub fn with_sync_on_commit(mut self, sync: bool) -> Self {
        self.sync_on_commit = sync;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }
        if self.max_chunk_size < MIN_CHUNK_SIZE {
            return Err(ConfigError::ChunkSizeTooSmall {
                size: self.max_chunk_size,
            });
        }
        if self.checksum_block_size == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Root directory not set
    #[error("Snapshot root directory must not be empty")]
    EmptyRoot,

    /// Chunk size below the minimum
    #[error("Chunk size {size} is below the 1KB minimum")]
    ChunkSizeTooSmall {
        /// Configured size
        size: usize,
    },

    /// Checksum block size is zero
    #[error("Checksum block size must be positive")]
    ZeroBlockSize,
}
