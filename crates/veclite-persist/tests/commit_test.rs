use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use veclite_core::config::HnswParams;
use veclite_core::{DatabaseConfig, Metric, Strategy, VecliteError};
use veclite_index::{SearchOptions, VectorStore};
use veclite_persist::{
    MemoryLock, PlacementMap, Session, SessionOptions, StoreSet, SystemClock,
};
use veclite_store::wal::WalRecord;
use veclite_store::{BlobIo, DynBlobStore, MemBlobStore};

/// Injects a one-shot failure on the first `atomic_write` whose key
/// contains the armed pattern.
struct FailOnce {
    inner: DynBlobStore,
    pattern: String,
    armed: Mutex<bool>,
}

impl FailOnce {
    fn new(inner: DynBlobStore, pattern: &str) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pattern: pattern.to_string(),
            armed: Mutex::new(true),
        })
    }
}

#[async_trait]
impl BlobIo for FailOnce {
    async fn read(&self, key: &str) -> veclite_core::Result<Bytes> {
        self.inner.read(key).await
    }
    async fn write(&self, key: &str, data: Bytes) -> veclite_core::Result<()> {
        self.inner.write(key, data).await
    }
    async fn append(&self, key: &str, data: Bytes) -> veclite_core::Result<()> {
        self.inner.append(key, data).await
    }
    async fn atomic_write(&self, key: &str, data: Bytes) -> veclite_core::Result<()> {
        if key.contains(&self.pattern) && std::mem::take(&mut *self.armed.lock()) {
            return Err(VecliteError::Io(std::io::Error::other(format!(
                "injected failure writing {key}"
            ))));
        }
        self.inner.atomic_write(key, data).await
    }
    async fn del(&self, key: &str) -> veclite_core::Result<()> {
        self.inner.del(key).await
    }
    async fn list(&self, prefix: &str) -> veclite_core::Result<Vec<String>> {
        self.inner.list(prefix).await
    }
}

fn hnsw_config() -> DatabaseConfig {
    let mut cfg = DatabaseConfig::new(3);
    cfg.metric = Metric::Cosine;
    cfg.strategy = Strategy::Hnsw;
    cfg.hnsw = HnswParams {
        m: 6,
        ef_construction: 32,
        ef_search: 16,
        seed: 7,
    };
    cfg
}

fn session_on(index: DynBlobStore, data: DynBlobStore) -> Session {
    let mut opts = SessionOptions::new("db", PlacementMap::single("data"));
    opts.result_consistency = true;
    opts.epsilon_ms = 0;
    Session::new(
        StoreSet::single(index, data),
        opts,
        Arc::new(MemoryLock::new()),
        Arc::new(SystemClock),
    )
}

fn populated(n: u32) -> VectorStore {
    let mut store = VectorStore::new(hnsw_config()).unwrap();
    for id in 0..n {
        let meta = format!(r#"{{"n":{id}}}"#);
        store
            .add(
                id,
                &[1.0 + id as f32, id as f32 * 0.5, 0.25],
                Some(Bytes::from(meta)),
                false,
            )
            .unwrap();
    }
    store
}

#[tokio::test]
async fn save_open_round_trip_preserves_every_column() {
    let session = session_on(Arc::new(MemBlobStore::new()), Arc::new(MemBlobStore::new()));
    let mut store = populated(25);
    let report = session.save_state(&mut store, None).await.unwrap();
    assert_eq!(report.epoch, 1);
    assert!(report.segments >= 1);

    let (opened, open_report) = session.open_state().await.unwrap();
    assert_eq!(open_report.rows, 25);
    assert!(open_report.ann_loaded);
    assert!(opened.table().check_compaction());
    for slot in 0..store.table().len() {
        let id = store.table().id_at(slot);
        let orig = store.get(id).unwrap();
        let back = opened.get(id).unwrap();
        assert_eq!(back.meta, orig.meta);
        for (a, b) in orig.vector.iter().zip(back.vector.iter()) {
            assert!((a - b).abs() <= f32::EPSILON, "vector drift for id {id}");
        }
    }
}

#[tokio::test]
async fn every_injected_failure_point_leaves_previous_head_readable() {
    for pattern in [".data", ".manifest.json", ".catalog.json", ".index", ".head.json"] {
        let raw_index: DynBlobStore = Arc::new(MemBlobStore::new());
        let raw_data: DynBlobStore = Arc::new(MemBlobStore::new());

        // Commit epoch 1 cleanly.
        let clean = session_on(raw_index.clone(), raw_data.clone());
        let mut store = populated(10);
        clean.save_state(&mut store, None).await.unwrap();

        // Epoch 2 dies at the injected point.
        let failing_index: DynBlobStore = FailOnce::new(raw_index.clone(), pattern);
        let failing_data: DynBlobStore = FailOnce::new(raw_data.clone(), pattern);
        let failing = session_on(failing_index, failing_data);
        let (_, report) = failing.open_state().await.unwrap();
        assert_eq!(report.epoch, 1);
        store.add(99, &[9.0, 9.0, 9.0], None, false).unwrap();
        let err = failing.save_state(&mut store, None).await.unwrap_err();
        assert!(matches!(err, VecliteError::Io(_)), "{pattern}: {err}");

        // The previous committed snapshot is still what opens.
        let reopened = session_on(raw_index, raw_data);
        let (state, report) = reopened.open_state().await.unwrap();
        assert_eq!(report.epoch, 1, "failure on {pattern} must not advance HEAD");
        assert_eq!(state.len(), 10, "failure on {pattern} leaked rows");
        assert!(!state.has(99));
    }
}

#[tokio::test]
async fn failed_ann_write_falls_back_to_rebuild_on_open() {
    let raw_index: DynBlobStore = Arc::new(MemBlobStore::new());
    let data: DynBlobStore = Arc::new(MemBlobStore::new());
    let failing: DynBlobStore = FailOnce::new(raw_index.clone(), ".index");
    let session = session_on(failing, data.clone());

    let mut store = VectorStore::new(hnsw_config()).unwrap();
    store
        .add(1, &[1.0, 0.0, 0.0], Some(Bytes::from_static(b"{\"tag\":\"a\"}")), false)
        .unwrap();
    store
        .add(2, &[0.0, 1.0, 0.0], Some(Bytes::from_static(b"{\"tag\":\"b\"}")), false)
        .unwrap();
    // First save fails while writing the ANN payload; nothing committed.
    assert!(session.save_state(&mut store, None).await.is_err());

    // Reconstruct from data: the manifest was already durable, the ANN
    // payload was not, so the artifact is rebuilt.
    let reopened = session_on(raw_index, data);
    let (state, report) = reopened.rebuild_state().await.unwrap();
    assert!(!report.ann_loaded);
    assert_eq!(state.len(), 2);
    assert_eq!(
        state.get_meta(1).unwrap().unwrap(),
        Bytes::from_static(b"{\"tag\":\"a\"}")
    );
    assert_eq!(
        state.get_meta(2).unwrap().unwrap(),
        Bytes::from_static(b"{\"tag\":\"b\"}")
    );
    let hits = state
        .search(&[1.0, 0.0, 0.0], &SearchOptions::new(1))
        .unwrap();
    assert_eq!(hits[0].id, 1);
}

#[tokio::test]
async fn checksum_failure_falls_through_to_replica() {
    let index: DynBlobStore = Arc::new(MemBlobStore::new());
    let a: DynBlobStore = Arc::new(MemBlobStore::new());
    let b: DynBlobStore = Arc::new(MemBlobStore::new());
    let stores = StoreSet::new(
        index.clone(),
        HashMap::from([("a".to_string(), a.clone()), ("b".to_string(), b.clone())]),
    );
    let mut opts = SessionOptions::new(
        "db",
        PlacementMap::new(16, 2, ["a".to_string(), "b".to_string()]),
    );
    opts.result_consistency = true;
    opts.epsilon_ms = 0;
    let session = Session::new(stores, opts, Arc::new(MemoryLock::new()), Arc::new(SystemClock));

    let mut store = populated(12);
    session.save_state(&mut store, None).await.unwrap();

    // Corrupt every segment copy on target `a`.
    for key in a.list("db-e").await.unwrap() {
        let mut buf = a.read(&key).await.unwrap().to_vec();
        let mid = buf.len() / 2;
        buf[mid] ^= 0xFF;
        a.write(&key, Bytes::from(buf)).await.unwrap();
    }

    let (state, _) = session.open_state().await.unwrap();
    assert_eq!(state.len(), 12, "replica b must cover the corrupt copies");
}

#[tokio::test]
async fn wal_tail_is_replayed_then_truncated_by_save() {
    let session = session_on(Arc::new(MemBlobStore::new()), Arc::new(MemBlobStore::new()));
    let mut store = populated(5);
    session.save_state(&mut store, None).await.unwrap();

    let wal = session.wal_writer();
    wal.append(&[WalRecord::Upsert {
        id: 77,
        vector: vec![0.5, 0.5, 0.5],
        meta: None,
    }])
    .await
    .unwrap();

    let (mut opened, report) = session.open_state().await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(opened.has(77));

    session.save_state(&mut opened, None).await.unwrap();
    assert!(wal.load().await.unwrap().is_empty(), "save truncates the WAL");
}

#[tokio::test]
async fn conflicting_epoch_is_authoritative() {
    let index: DynBlobStore = Arc::new(MemBlobStore::new());
    let data: DynBlobStore = Arc::new(MemBlobStore::new());

    let writer_a = session_on(index.clone(), data.clone());
    let writer_b = session_on(index.clone(), data.clone());

    let mut store_a = populated(4);
    writer_a.save_state(&mut store_a, None).await.unwrap();

    // B opens at epoch 1, then A commits epoch 2 behind B's back.
    let (mut store_b, _) = writer_b.open_state().await.unwrap();
    writer_a.save_state(&mut store_a, None).await.unwrap();

    store_b.add(50, &[1.0, 1.0, 1.0], None, false).unwrap();
    let err = writer_b.save_state(&mut store_b, None).await.unwrap_err();
    assert!(
        matches!(err, VecliteError::ConflictEpoch { .. }),
        "expected ConflictEpoch, got {err}"
    );
}
