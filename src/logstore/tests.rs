use super::*;
use crate::error::StorageError;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

async fn open_store(dir: &TempDir) -> DurableLogStore {
    DurableLogStore::open(&dir.path().join("local.db"), Duration::from_secs(5))
        .await
        .unwrap()
}

#[test]
fn test_category_round_trip_and_tables() {
    for category in [
        LogCategory::EventCaptured,
        LogCategory::EventRejected,
        LogCategory::CheckedMotion,
        LogCategory::CameraError,
        LogCategory::StorageError,
        LogCategory::FrameUpload,
        LogCategory::UploadBackoff,
        LogCategory::RadioPower,
        LogCategory::FrameQuarantined,
    ] {
        assert_eq!(LogCategory::parse(category.as_str()), category);
    }
    assert_eq!(
        LogCategory::parse("LEGACY_THING"),
        LogCategory::Other("LEGACY_THING".to_string())
    );

    assert_eq!(LogCategory::EventCaptured.table(), LogTable::Capture);
    assert_eq!(LogCategory::FrameUpload.table(), LogTable::Upload);
    assert_eq!(LogCategory::FrameQuarantined.table(), LogTable::Upload);
    assert_eq!("upload".parse::<LogTable>().unwrap(), LogTable::Upload);
    assert!("bogus".parse::<LogTable>().is_err());
}

#[tokio::test]
async fn test_append_and_pending() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    store
        .append(LogEntry::new(LogCategory::EventCaptured, "event a"))
        .await
        .unwrap();
    store
        .append(LogEntry::new(LogCategory::FrameUpload, "frame 1"))
        .await
        .unwrap();
    store
        .append(LogEntry::settled(LogCategory::RadioPower, "radio on"))
        .await
        .unwrap();

    let pending = store.pending().await.unwrap();
    assert_eq!(pending.capture.len(), 1);
    assert_eq!(pending.upload.len(), 1);
    assert_eq!(pending.capture[0].message, "event a");
    assert_eq!(pending.upload[0].category, LogCategory::FrameUpload);

    assert_eq!(store.entries(LogTable::Upload).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_colliding_datestamps_are_bumped() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let mut first = LogEntry::new(LogCategory::CheckedMotion, "one");
    first.datestamp = "2024-03-10T10:00:00.000000".to_string();
    let mut second = first.clone();
    second.message = "two".to_string();

    let a = store.append(first).await.unwrap();
    let b = store.append(second).await.unwrap();

    assert_eq!(a.datestamp, "2024-03-10T10:00:00.000000");
    assert_eq!(b.datestamp, "2024-03-10T10:00:00.000001");

    // Marking one does not touch the other
    assert_eq!(store.mark_done(&[a]).await.unwrap(), 1);
    let pending = store.pending().await.unwrap();
    assert_eq!(pending.capture.len(), 1);
    assert_eq!(pending.capture[0].message, "two");
}

#[tokio::test]
async fn test_mark_done_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    let entry = store
        .append(LogEntry::new(LogCategory::FrameUpload, "frame"))
        .await
        .unwrap();

    assert_eq!(store.mark_done(&[entry.clone()]).await.unwrap(), 1);
    assert_eq!(store.mark_done(&[entry.clone()]).await.unwrap(), 0);
    assert_eq!(store.mark_done(&[]).await.unwrap(), 0);
    assert!(store.pending().await.unwrap().is_empty());

    let all = store.entries(LogTable::Upload).await.unwrap();
    assert_eq!(all.len(), 1);
    assert!(!all[0].pending);
}

#[tokio::test]
async fn test_dropped_transaction_rolls_back() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir).await;

    {
        let mut tx = store.transaction().await.unwrap();
        tx.append(LogEntry::new(LogCategory::EventCaptured, "lost"))
            .await
            .unwrap();
        // dropped without commit, as in a crash mid-operation
    }

    let mut tx = store.transaction().await.unwrap();
    tx.append(LogEntry::new(LogCategory::EventCaptured, "rolled back"))
        .await
        .unwrap();
    tx.rollback().await.unwrap();

    assert!(store.entries(LogTable::Capture).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let store = open_store(&dir).await;
        store
            .append(LogEntry::new(LogCategory::EventCaptured, "persisted"))
            .await
            .unwrap();
    }

    let store = open_store(&dir).await;
    let pending = store.pending().await.unwrap();
    assert_eq!(pending.capture.len(), 1);
    assert_eq!(pending.capture[0].message, "persisted");
}

#[tokio::test]
async fn test_held_lock_times_out() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("local.db");
    let store = DurableLogStore::open(&path, Duration::from_millis(200))
        .await
        .unwrap();

    let held = store.transaction().await.unwrap();
    let result = store
        .append(LogEntry::new(LogCategory::EventCaptured, "blocked"))
        .await;
    assert!(matches!(result, Err(StorageError::LockTimeout { .. })));

    held.commit().await.unwrap();
    assert!(store
        .append(LogEntry::new(LogCategory::EventCaptured, "free"))
        .await
        .is_ok());
}

#[tokio::test]
async fn test_concurrent_appends_are_serialized() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(open_store(&dir).await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .append(LogEntry::new(LogCategory::CheckedMotion, format!("probe {i}")))
                .await
                .unwrap()
        }));
    }

    let mut stamps = Vec::new();
    for handle in handles {
        stamps.push(handle.await.unwrap().datestamp);
    }
    stamps.sort();
    stamps.dedup();
    assert_eq!(stamps.len(), 8);
    assert_eq!(store.entries(LogTable::Capture).await.unwrap().len(), 8);
}
