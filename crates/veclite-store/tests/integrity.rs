use bytes::Bytes;
use std::sync::Arc;
use veclite_core::VecliteError;
use veclite_store::wal::{WalRecord, WalWriter};
use veclite_store::{BlobIo, FsBlobStore, MemBlobStore};

fn upsert(id: u32, x: f32) -> WalRecord {
    WalRecord::Upsert {
        id,
        vector: vec![x, 0.0],
        meta: None,
    }
}

#[tokio::test]
async fn wal_writer_appends_and_loads_across_batches() {
    let store = Arc::new(MemBlobStore::new());
    let wal = WalWriter::new(store.clone(), "db.wal");

    wal.append(&[upsert(1, 0.1), upsert(2, 0.2)]).await.unwrap();
    wal.append(&[WalRecord::Remove { id: 1 }]).await.unwrap();

    let records = wal.load().await.unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[2], WalRecord::Remove { id: 1 });

    wal.truncate().await.unwrap();
    assert!(wal.load().await.unwrap().is_empty());
}

#[tokio::test]
async fn wal_survives_partial_trailing_write_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FsBlobStore::new(dir.path()).unwrap());
    let wal = WalWriter::new(store.clone(), "db.wal");

    for i in 0..3u32 {
        wal.append(&[upsert(i, i as f32)]).await.unwrap();
    }

    // Simulate a crash mid-append: chop bytes off the tail.
    let full = store.read("db.wal").await.unwrap();
    store
        .write("db.wal", full.slice(..full.len() - 5))
        .await
        .unwrap();

    let records = wal.load().await.unwrap();
    assert_eq!(records.len(), 2, "torn record must be discarded");
}

#[tokio::test]
async fn wal_mid_stream_corruption_surfaces_offset() {
    let store = Arc::new(MemBlobStore::new());
    let wal = WalWriter::new(store.clone(), "db.wal");
    wal.append(&[upsert(1, 1.0), upsert(2, 2.0)]).await.unwrap();

    let mut buf = store.read("db.wal").await.unwrap().to_vec();
    // Second record starts after the 8-byte frame header and one
    // 22-byte upsert record (14 header + 8 vector bytes).
    buf[30] = 0xEE;
    store.write("db.wal", Bytes::from(buf)).await.unwrap();

    match wal.load().await {
        Err(VecliteError::Corrupt { offset, .. }) => assert_eq!(offset, 30),
        other => panic!("expected Corrupt, got {other:?}"),
    }
}
