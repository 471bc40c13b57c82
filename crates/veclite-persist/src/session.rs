#![allow(clippy::cast_possible_truncation)]

use crate::lock::LockProvider;
use crate::manifest::{
    catalog_key, from_json_bytes, head_key, index_key, manifest_key, segment_name,
    segment_prefix, to_json_bytes, wal_key, Catalog, Head, Manifest, SegmentEntry,
    CATALOG_VERSION, MANIFEST_VERSION,
};
use crate::placement::PlacementMap;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use veclite_core::{CancelFlag, DatabaseConfig, Result, VecliteError};
use veclite_index::VectorStore;
use veclite_store::segment::{decode_segment, encode_segment, frame_checksum, plan_segments, SegmentRow};
use veclite_store::wal::WalWriter;
use veclite_store::DynBlobStore;

/// Wall clock for commit timestamps and bounded-staleness reads;
/// pluggable so tests can inject skew.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// The blob stores one collection spans: one index store for the
/// catalog/manifest/HEAD/WAL/ANN artifacts, and a store per placement
/// target for data segments.
#[derive(Clone)]
pub struct StoreSet {
    pub index: DynBlobStore,
    data: HashMap<String, DynBlobStore>,
}

impl StoreSet {
    pub fn new(index: DynBlobStore, data: HashMap<String, DynBlobStore>) -> Self {
        Self { index, data }
    }

    /// Everything on one store under the target key `data`.
    pub fn single(index: DynBlobStore, data: DynBlobStore) -> Self {
        Self {
            index,
            data: HashMap::from([("data".to_string(), data)]),
        }
    }

    pub fn target_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.keys().cloned().collect();
        keys.sort_unstable();
        keys
    }

    pub fn data_for(&self, target_key: &str) -> Result<&DynBlobStore> {
        self.data
            .get(target_key)
            .ok_or_else(|| VecliteError::NotFound(format!("data target {target_key}")))
    }

    fn data_stores(&self) -> impl Iterator<Item = (&String, &DynBlobStore)> {
        self.data.iter()
    }
}

/// Resolved persistence knobs for one collection.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub name: String,
    pub segmented: bool,
    pub segment_bytes: usize,
    pub include_ann: bool,
    pub placement: PlacementMap,
    pub result_consistency: bool,
    pub epsilon_ms: u64,
    pub lock_name: String,
    pub lock_ttl_ms: u64,
}

impl SessionOptions {
    pub fn new(name: impl Into<String>, placement: PlacementMap) -> Self {
        let name = name.into();
        Self {
            lock_name: format!("{name}.save"),
            name,
            segmented: true,
            segment_bytes: 4 * 1024 * 1024,
            include_ann: true,
            placement,
            result_consistency: false,
            epsilon_ms: 500,
            lock_ttl_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReport {
    pub epoch: u64,
    pub commit_ts: u64,
    pub segments: usize,
    pub rebuilt_ann: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenReport {
    pub epoch: u64,
    pub rows: usize,
    pub replayed: usize,
    pub ann_loaded: bool,
}

/// Save/open transactions for one collection over a [`StoreSet`].
///
/// The save pipeline is single-writer: named lock, segments, manifest,
/// catalog, ANN payload, CAS HEAD, WAL truncation — in that order, so a
/// crash at any point leaves the previous committed snapshot readable.
pub struct Session {
    stores: StoreSet,
    opts: SessionOptions,
    lock: Arc<dyn LockProvider>,
    clock: Arc<dyn Clock>,
    holder: String,
    last_epoch: Mutex<u64>,
}

impl Session {
    pub fn new(
        stores: StoreSet,
        opts: SessionOptions,
        lock: Arc<dyn LockProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            holder: format!("veclite-{}", std::process::id()),
            stores,
            opts,
            lock,
            clock,
            last_epoch: Mutex::new(0),
        }
    }

    pub fn stores(&self) -> &StoreSet {
        &self.stores
    }

    pub fn options(&self) -> &SessionOptions {
        &self.opts
    }

    pub fn wal_writer(&self) -> WalWriter {
        WalWriter::new(self.stores.index.clone(), wal_key(&self.opts.name))
    }

    pub fn last_epoch(&self) -> u64 {
        *self.last_epoch.lock()
    }

    pub(crate) fn set_last_epoch(&self, epoch: u64) {
        *self.last_epoch.lock() = epoch;
    }

    pub(crate) fn lock_provider(&self) -> &Arc<dyn LockProvider> {
        &self.lock
    }

    pub(crate) fn holder_id(&self) -> &str {
        &self.holder
    }

    pub(crate) fn clock_now(&self) -> u64 {
        self.clock.now_ms()
    }

    pub(crate) async fn read_head_pub(&self) -> Result<Option<Head>> {
        self.read_head().await
    }

    /// The currently committed manifest (HEAD first, default manifest as
    /// the fallback); input for rebalance planning.
    pub async fn current_manifest(&self) -> Result<Manifest> {
        if let Some(head) = self.read_head().await? {
            return Ok(head.manifest);
        }
        let key = manifest_key(&self.opts.name);
        let buf = self.stores.index.read(&key).await?;
        from_json_bytes(&key, &buf)
    }

    async fn read_head(&self) -> Result<Option<Head>> {
        let key = head_key(&self.opts.name);
        match self.stores.index.read(&key).await {
            Ok(buf) => Ok(Some(from_json_bytes(&key, &buf)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn check_cancel(cancel: Option<&CancelFlag>) -> Result<()> {
        match cancel {
            Some(flag) if flag.is_cancelled() => Err(VecliteError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Persists the store as a new epoch. Atomic: either HEAD advances
    /// or nothing durable changes from a reader's point of view.
    pub async fn save_state(
        &self,
        store: &mut VectorStore,
        cancel: Option<&CancelFlag>,
    ) -> Result<SaveReport> {
        let acquired = self
            .lock
            .acquire(&self.opts.lock_name, self.opts.lock_ttl_ms, &self.holder)
            .await?;
        let result = self.save_locked(store, acquired.epoch, cancel).await;
        // Best-effort release; the TTL reclaims the lock either way.
        let _ = self
            .lock
            .release(&self.opts.lock_name, acquired.epoch, &self.holder)
            .await;
        result
    }

    async fn save_locked(
        &self,
        store: &mut VectorStore,
        lock_epoch: u64,
        cancel: Option<&CancelFlag>,
    ) -> Result<SaveReport> {
        let name = self.opts.name.clone();
        let head = self.read_head().await?;
        let old_epoch = head.as_ref().map_or(0, |h| h.epoch);

        // The caller must have observed the current committed epoch.
        let known = self.last_epoch();
        if old_epoch != known {
            return Err(VecliteError::ConflictEpoch {
                expected: known,
                found: old_epoch,
            });
        }
        Self::check_cancel(cancel)?;

        let mut rebuilt_ann = false;
        if store.ann_needs_rebuild() {
            debug!(collection = %name, "ann artifact degraded, rebuilding before save");
            store.rebuild_ann();
            rebuilt_ann = true;
        }

        let new_epoch = old_epoch + 1;
        let dim = store.table().dim();
        let rows: Vec<SegmentRow> = store
            .table()
            .rows()
            .map(|(id, vector, meta)| SegmentRow {
                id,
                meta: meta.cloned(),
                vector: vector.to_vec(),
            })
            .collect();
        let chunks = if self.opts.segmented {
            plan_segments(dim, &rows, self.opts.segment_bytes)
        } else if rows.is_empty() {
            Vec::new()
        } else {
            vec![rows.clone()]
        };

        // Data segments first: they must be visible before the manifest
        // that references them.
        let mut entries = Vec::with_capacity(chunks.len());
        for (i, chunk) in chunks.iter().enumerate() {
            Self::check_cancel(cancel)?;
            // Long save: keep the TTL ahead of the remaining writes.
            if i > 0 && i % 16 == 0 {
                self.lock
                    .renew(
                        &self.opts.lock_name,
                        lock_epoch,
                        self.opts.lock_ttl_ms,
                        &self.holder,
                    )
                    .await?;
            }
            let seg_name = segment_name(&name, new_epoch, i);
            let frame = encode_segment(dim, chunk)?;
            let checksum = frame_checksum(&frame)
                .ok_or_else(|| VecliteError::corrupt(0, "segment frame too short"))?;
            let targets = self.opts.placement.assign(&seg_name);
            for target in &targets {
                self.stores
                    .data_for(target)?
                    .atomic_write(&seg_name, frame.clone())
                    .await?;
            }
            entries.push(SegmentEntry {
                name: seg_name,
                target_key: targets
                    .first()
                    .map_or_else(|| "data".to_string(), ToString::to_string),
                rows: chunk.len() as u32,
                bytes: frame.len() as u64,
                checksum,
            });
        }

        let commit_ts = self.clock.now_ms();
        let strategy = store.config().strategy;
        let ann_payload = if self.opts.include_ann {
            store.ann_to_bytes()?
        } else {
            None
        };
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            epoch: new_epoch,
            commit_ts,
            dim: dim as u32,
            metric: store.config().metric,
            strategy,
            segments: entries,
            placement: self.opts.placement.clone(),
            ann_fingerprint: ann_payload
                .is_some()
                .then(|| veclite_index::snapshot::table_fingerprint(store.table(), strategy)),
        };
        let catalog = Catalog {
            version: CATALOG_VERSION,
            name: name.clone(),
            database: store.config().clone(),
            count: store.len() as u64,
            segmented: self.opts.segmented,
        };

        Self::check_cancel(cancel)?;
        self.stores
            .index
            .atomic_write(&manifest_key(&name), to_json_bytes(&manifest)?)
            .await?;
        self.stores
            .index
            .atomic_write(&catalog_key(&name), to_json_bytes(&catalog)?)
            .await?;

        match &ann_payload {
            Some(payload) => {
                self.stores
                    .index
                    .atomic_write(&index_key(&name), Bytes::from(payload.clone()))
                    .await?;
            }
            None => {
                self.stores.index.del(&index_key(&name)).await?;
            }
        }

        // CAS on the committed epoch: authoritative, never best-effort.
        Self::check_cancel(cancel)?;
        let current = self.read_head().await?;
        let current_epoch = current.as_ref().map_or(0, |h| h.epoch);
        if current_epoch != old_epoch {
            return Err(VecliteError::ConflictEpoch {
                expected: old_epoch,
                found: current_epoch,
            });
        }
        let head = Head {
            manifest: manifest.clone(),
            epoch: new_epoch,
            commit_ts,
        };
        self.stores
            .index
            .atomic_write(&head_key(&name), to_json_bytes(&head)?)
            .await?;

        // Durable now; the WAL tail is superseded.
        self.stores.index.del(&wal_key(&name)).await?;
        self.collect_orphans(&manifest).await;

        *self.last_epoch.lock() = new_epoch;
        info!(
            collection = %name,
            epoch = new_epoch,
            segments = manifest.segments.len(),
            "snapshot committed"
        );
        Ok(SaveReport {
            epoch: new_epoch,
            commit_ts,
            segments: manifest.segments.len(),
            rebuilt_ann,
        })
    }

    /// Deletes segment blobs no longer referenced by the committed
    /// manifest. Best-effort; leaks are retried at the next save.
    async fn collect_orphans(&self, manifest: &Manifest) {
        let live: HashSet<&str> = manifest.segments.iter().map(|s| s.name.as_str()).collect();
        let prefix = segment_prefix(&self.opts.name);
        for (target, store) in self.stores.data_stores() {
            let Ok(keys) = store.list(&prefix).await else {
                continue;
            };
            for key in keys {
                if !live.contains(key.as_str()) {
                    debug!(target = %target, segment = %key, "deleting orphaned segment");
                    let _ = store.del(&key).await;
                }
            }
        }
    }

    /// Opens the committed state: bounded-staleness HEAD (or the default
    /// manifest), segment decode with replica fallthrough, ANN payload
    /// or rebuild, then WAL tail replay.
    pub async fn open_state(&self) -> Result<(VectorStore, OpenReport)> {
        self.open_inner(true).await
    }

    /// Opens ignoring any ANN payload; the artifact is rebuilt from data.
    pub async fn rebuild_state(&self) -> Result<(VectorStore, OpenReport)> {
        self.open_inner(false).await
    }

    async fn open_inner(&self, use_ann_payload: bool) -> Result<(VectorStore, OpenReport)> {
        let name = self.opts.name.clone();
        let head = self.read_head().await?;
        let manifest = self.choose_manifest(head).await?;

        let config = self.read_catalog(&manifest).await?;
        let mut rows: Vec<(u32, Vec<f32>, Option<Bytes>)> = Vec::new();
        for entry in &manifest.segments {
            let decoded = self.read_segment(&manifest, entry).await?;
            rows.extend(decoded);
        }
        let row_count = rows.len();
        let mut store = VectorStore::from_rows(config, rows)?;

        let mut ann_loaded = false;
        if use_ann_payload && self.opts.include_ann && manifest.ann_fingerprint.is_some() {
            match self.stores.index.read(&index_key(&name)).await {
                Ok(payload) => match store.ann_from_bytes(&payload) {
                    Ok(true) => ann_loaded = true,
                    Ok(false) => {
                        warn!(collection = %name, "ann payload does not match table, rebuilding");
                    }
                    Err(e) => {
                        warn!(collection = %name, error = %e, "ann payload unreadable, rebuilding");
                    }
                },
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if !ann_loaded {
            store.rebuild_ann();
        }

        // Catch up from the WAL tail bound to this collection.
        let wal = self.wal_writer();
        let records = wal.load().await?;
        for record in &records {
            store.apply_wal_record(record)?;
        }

        *self.last_epoch.lock() = manifest.epoch;
        debug!(
            collection = %name,
            epoch = manifest.epoch,
            rows = row_count,
            replayed = records.len(),
            "state opened"
        );
        Ok((
            store,
            OpenReport {
                epoch: manifest.epoch,
                rows: row_count,
                replayed: records.len(),
                ann_loaded,
            },
        ))
    }

    /// Bounded-staleness manifest choice: with `result_consistency`, a
    /// HEAD at least `epsilon_ms` old pins the snapshot; otherwise the
    /// default manifest is read, with HEAD as the fallback.
    async fn choose_manifest(&self, head: Option<Head>) -> Result<Manifest> {
        if self.opts.result_consistency {
            if let Some(h) = &head {
                if h.commit_ts + self.opts.epsilon_ms <= self.clock.now_ms() {
                    return Ok(h.manifest.clone());
                }
            }
        }
        let key = manifest_key(&self.opts.name);
        match self.stores.index.read(&key).await {
            Ok(buf) => from_json_bytes(&key, &buf),
            Err(e) if e.is_not_found() => head.map(|h| h.manifest).ok_or_else(|| {
                VecliteError::NotFound(format!("{}: no manifest or head", self.opts.name))
            }),
            Err(e) => Err(e),
        }
    }

    async fn read_catalog(&self, manifest: &Manifest) -> Result<DatabaseConfig> {
        let key = catalog_key(&self.opts.name);
        match self.stores.index.read(&key).await {
            Ok(buf) => {
                let catalog: Catalog = from_json_bytes(&key, &buf)?;
                Ok(catalog.database)
            }
            Err(e) if e.is_not_found() => {
                // Degraded open: reconstruct the descriptor from the
                // manifest with default strategy params.
                let mut config = DatabaseConfig::new(manifest.dim as usize);
                config.metric = manifest.metric;
                config.strategy = manifest.strategy;
                Ok(config)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads one segment, trying the recorded target first and then the
    /// remaining placement replicas; checksum failures fall through to
    /// the next replica.
    async fn read_segment(
        &self,
        manifest: &Manifest,
        entry: &SegmentEntry,
    ) -> Result<Vec<(u32, Vec<f32>, Option<Bytes>)>> {
        let mut targets: Vec<&str> = vec![entry.target_key.as_str()];
        for t in manifest.placement.assign(&entry.name) {
            if !targets.contains(&t) {
                targets.push(t);
            }
        }

        let mut last_detail = String::new();
        for target in targets {
            let Ok(store) = self.stores.data_for(target) else {
                continue;
            };
            match store.read(&entry.name).await {
                Ok(frame) => match decode_segment(&frame) {
                    Ok((_, segment_rows)) => {
                        if frame_checksum(&frame) != Some(entry.checksum) {
                            warn!(segment = %entry.name, target, "checksum drift, trying next replica");
                            last_detail = format!("{target}: manifest checksum mismatch");
                            continue;
                        }
                        return Ok(segment_rows
                            .into_iter()
                            .map(|r| (r.id, r.vector, r.meta))
                            .collect());
                    }
                    Err(e) => {
                        warn!(segment = %entry.name, target, error = %e, "replica corrupt");
                        last_detail = format!("{target}: {e}");
                    }
                },
                Err(e) if e.is_not_found() => {
                    last_detail = format!("{target}: blob missing");
                }
                Err(e) => return Err(e),
            }
        }
        // Exhausting replicas is a corruption condition, never NotFound:
        // a missing-collection signal here would mask real data loss.
        Err(VecliteError::corrupt(
            0,
            format!(
                "segment {} unreadable on all replicas ({last_detail})",
                entry.name
            ),
        ))
    }
}
