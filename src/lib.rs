//! snapstore - Crash-safe snapshot store for log-replicated partitions
//!
//! Each partition replica captures its state machine into snapshots so that
//! its replicated log can be compacted and new or lagging replicas can be
//! seeded without replaying the whole log.
//!
//! # Quick Start
//!
//! ```ignore
//! use snapstore::{SnapshotStore, SnapshotStoreConfig};
//!
//! let store = SnapshotStore::open(SnapshotStoreConfig::new("/data/partition-1")).await?;
//!
//! // Take a snapshot locally
//! let transient = store.new_transient_snapshot(10, 1, 100, 50, false).await?;
//! transient.take(|dir| std::fs::write(dir.join("state.db"), b"...")).await?;
//! let snapshot = transient.persist().await?;
//!
//! // Stream it to another replica
//! for chunk in snapshot.new_chunk_reader(512 * 1024)? {
//!     send(chunk?);
//! }
//! ```
//!
//! # Architecture
//!
//! [`SnapshotStore`] owns one partition root. Every mutation runs on the
//! store's serialized context; reads of the current snapshot do not.
//! A snapshot is committed once its checksum file is renamed into place.

pub use snapstore_core as core;
pub use snapstore_durability::*;
