//! Reservation tests
//!
//! Reservations keep superseded snapshots alive. These tests verify:
//! - in-memory reservations protect a snapshot until released
//! - persisted reservations survive restart and expire by the clock
//! - deleted snapshots cannot be reserved
//! - the compaction bound follows the oldest available snapshot

use std::sync::Arc;

use snapstore_durability::testing::ManualClock;
use snapstore_durability::{
    Clock, PersistedSnapshot, ReservationKind, ReservationReason, SnapshotError, SnapshotId,
    SnapshotStore, SnapshotStoreConfig,
};
use tempfile::TempDir;

const HOUR: i64 = 60 * 60 * 1000;

async fn open(temp_dir: &TempDir, clock: &Arc<ManualClock>) -> SnapshotStore {
    let clock: Arc<dyn Clock> = clock.clone();
    SnapshotStore::open_with_clock(SnapshotStoreConfig::for_testing(temp_dir.path()), clock)
        .await
        .unwrap()
}

async fn commit(store: &SnapshotStore, index: u64) -> Arc<PersistedSnapshot> {
    let transient = store
        .new_transient_snapshot(index, 1, index as i64 * 10, index as i64 * 5, false)
        .await
        .unwrap();
    transient
        .take(move |dir| std::fs::write(dir.join("data"), index.to_be_bytes()))
        .await
        .unwrap();
    transient.persist().await.unwrap()
}

fn ids(snapshots: &[Arc<PersistedSnapshot>]) -> Vec<SnapshotId> {
    snapshots.iter().map(|s| s.id().clone()).collect()
}

#[tokio::test]
async fn test_in_memory_reservation_protects_until_released() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&temp_dir, &clock).await;

    let first = commit(&store, 10).await;
    let reservation = store
        .reserve(first.id(), ReservationReason::ScaleUp)
        .await
        .unwrap();
    assert_eq!(reservation.reservation().kind, ReservationKind::InMemory);
    assert_eq!(reservation.snapshot_id(), first.id());

    let second = commit(&store, 20).await;
    assert!(first.path().exists());
    assert!(first.is_reserved());
    assert_eq!(
        ids(&store.available_snapshots().await.unwrap()),
        vec![first.id().clone(), second.id().clone()]
    );
    assert_eq!(store.compaction_bound().await.unwrap(), Some(10));

    // The next commit deletes it once nothing holds it.
    reservation.release();
    let third = commit(&store, 30).await;
    assert!(!first.path().exists());
    assert!(first.is_deleted());
    assert!(!second.path().exists());
    assert_eq!(
        ids(&store.available_snapshots().await.unwrap()),
        vec![third.id().clone()]
    );
    assert_eq!(store.compaction_bound().await.unwrap(), Some(30));
}

#[tokio::test]
async fn test_dropped_guard_releases() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&temp_dir, &clock).await;

    let first = commit(&store, 10).await;
    {
        let _guard = store
            .reserve(first.id(), ReservationReason::Backup)
            .await
            .unwrap();
        assert!(first.is_reserved());
    }
    assert!(!first.is_reserved());
    commit(&store, 20).await;
    assert!(!first.path().exists());
}

#[tokio::test]
async fn test_deleted_snapshot_cannot_be_reserved() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&temp_dir, &clock).await;

    let first = commit(&store, 10).await;
    commit(&store, 20).await;

    assert!(matches!(
        store.reserve(first.id(), ReservationReason::Backup).await,
        Err(SnapshotError::NotFound { .. })
    ));
    assert!(matches!(
        store
            .reserve_persisted(first.id(), 2 * HOUR, ReservationReason::Backup)
            .await,
        Err(SnapshotError::NotFound { .. })
    ));
    assert!(matches!(
        first.new_chunk_reader(1024),
        Err(SnapshotError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_persisted_reservation_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));

    let (first, reservation) = {
        let store = open(&temp_dir, &clock).await;
        let first = commit(&store, 10).await;
        let reservation = store
            .reserve_persisted(first.id(), 1_000 + HOUR, ReservationReason::Backup)
            .await
            .unwrap();
        assert_eq!(reservation.kind, ReservationKind::Persisted);
        commit(&store, 20).await;
        store.close().await;
        (first.id().clone(), reservation)
    };

    // Still within validity: the older snapshot is recovered as available.
    {
        let store = open(&temp_dir, &clock).await;
        assert_eq!(store.latest_snapshot().unwrap().id().index(), 20);
        let available = store.available_snapshots().await.unwrap();
        assert_eq!(available.len(), 2);
        let older = available.iter().find(|s| s.id() == &first).unwrap();
        assert_eq!(older.reservations().reservations(), vec![reservation]);
        store.close().await;
    }

    // Expired: the next restart deletes it.
    clock.advance(2 * HOUR);
    let store = open(&temp_dir, &clock).await;
    assert_eq!(store.available_snapshots().await.unwrap().len(), 1);
    assert!(!store.paths().snapshot_dir(&first).exists());
    assert!(!store.paths().reservation_path(&first).exists());
}

#[tokio::test]
async fn test_persisted_reservation_expires_at_runtime() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&temp_dir, &clock).await;

    let first = commit(&store, 10).await;
    store
        .reserve_persisted(first.id(), 1_000 + HOUR, ReservationReason::ScaleUp)
        .await
        .unwrap();
    commit(&store, 20).await;
    assert!(first.path().exists());

    clock.advance(HOUR + 1);
    assert!(!first.is_reserved());
    commit(&store, 30).await;
    assert!(!first.path().exists());
}

#[tokio::test]
async fn test_remove_persisted_reservation() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));
    let store = open(&temp_dir, &clock).await;

    let first = commit(&store, 10).await;
    let reservation = store
        .reserve_persisted(first.id(), 1_000 + HOUR, ReservationReason::Backup)
        .await
        .unwrap();
    assert!(store.paths().reservation_path(first.id()).exists());

    assert!(store
        .remove_persisted_reservation(first.id(), reservation.id)
        .await
        .unwrap());
    assert!(!store
        .remove_persisted_reservation(first.id(), reservation.id)
        .await
        .unwrap());

    commit(&store, 20).await;
    assert!(!first.path().exists());
}

#[tokio::test]
async fn test_corrupt_reservation_file_fails_open() {
    let temp_dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(1_000));

    let reservation_path = {
        let store = open(&temp_dir, &clock).await;
        let first = commit(&store, 10).await;
        store
            .reserve_persisted(first.id(), 1_000 + HOUR, ReservationReason::Backup)
            .await
            .unwrap();
        store.close().await;
        store.paths().reservation_path(first.id())
    };

    std::fs::write(&reservation_path, b"\xff\xff\xff").unwrap();

    let clock: Arc<dyn Clock> = clock;
    let result = SnapshotStore::open_with_clock(
        SnapshotStoreConfig::for_testing(temp_dir.path()),
        clock,
    )
    .await;
    assert!(result.is_err());
}
