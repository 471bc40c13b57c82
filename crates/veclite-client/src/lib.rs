#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]

//! Embedded veclite client: a single-writer front door over the vector
//! store, with WAL-before-mutation durability and auto-save.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::{debug, info};
use veclite_core::config::{AutoSaveConfig, DataStorageConfig};
use veclite_core::{CancelFlag, Config, Filter, Result, VecliteError};
use veclite_index::{Hit, Record, SearchOptions, VectorStore};
use veclite_persist::{
    plan_rebalance, ApplyOptions, Clock, LockProvider, MemoryLock, Move, OpenReport,
    PlacementMap, RebalanceReport, SaveReport, Session, SessionOptions, StoreSet, SystemClock,
};
use veclite_store::wal::{WalRecord, WalWriter};
use veclite_store::SchemeRegistry;

/// Pluggable collaborators for [`connect_with`]; hosts override URI
/// schemes, the lock provider or the clock.
pub struct ConnectOptions {
    pub registry: SchemeRegistry,
    pub lock: Arc<dyn LockProvider>,
    pub clock: Arc<dyn Clock>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            registry: SchemeRegistry::with_defaults(),
            lock: Arc::new(MemoryLock::new()),
            clock: Arc::new(SystemClock),
        }
    }
}

/// Opens (or creates) a collection described by `config`.
pub async fn connect(config: Config) -> Result<Client> {
    connect_with(config, ConnectOptions::default()).await
}

pub async fn connect_with(config: Config, options: ConnectOptions) -> Result<Client> {
    let index_store = options.registry.open(&config.storage.index)?;
    let data_stores = match &config.storage.data {
        DataStorageConfig::Uri(uri) => {
            HashMap::from([("data".to_string(), options.registry.open(uri)?)])
        }
        DataStorageConfig::Map(map) => {
            let mut stores = HashMap::new();
            for (key, uri) in map {
                stores.insert(key.clone(), options.registry.open(uri)?);
            }
            stores
        }
    };
    let mut target_keys: Vec<String> = data_stores.keys().cloned().collect();
    target_keys.sort_unstable();
    let placement = PlacementMap::new(
        config.index.pgs,
        config.index.replicas,
        target_keys,
    );

    let mut session_opts = SessionOptions::new(config.index.name.clone(), placement);
    session_opts.segmented = config.index.segmented;
    session_opts.segment_bytes = config.index.segment_bytes;
    session_opts.include_ann = config.index.include_ann;
    session_opts.result_consistency = config.server.result_consistency;
    session_opts.epsilon_ms = config.server.epsilon_ms;
    session_opts.lock_ttl_ms = config.server.lock_ttl_ms;
    if let Some(name) = &config.server.lock_name {
        session_opts.lock_name.clone_from(name);
    }

    let session = Session::new(
        StoreSet::new(index_store, data_stores),
        session_opts,
        options.lock,
        options.clock,
    );
    let wal = session.wal_writer();

    // Open the committed state; a missing collection starts empty, but a
    // WAL tail left by a crash before the first save still replays.
    let store = match session.open_state().await {
        Ok((store, report)) => {
            info!(
                collection = %config.index.name,
                epoch = report.epoch,
                rows = report.rows,
                replayed = report.replayed,
                "collection opened"
            );
            store
        }
        Err(e) if e.is_not_found() => {
            let mut store = VectorStore::new(config.database.clone())?;
            let tail = wal.load().await?;
            for record in &tail {
                store.apply_wal_record(record)?;
            }
            if !tail.is_empty() {
                debug!(replayed = tail.len(), "replayed WAL into a fresh store");
            }
            store
        }
        Err(e) => return Err(e),
    };

    Ok(Client {
        inner: Arc::new(ClientInner {
            store: RwLock::new(store),
            session,
            wal,
            autosave: config.autosave,
            ops_since_save: AtomicU64::new(0),
            last_save: parking_lot::Mutex::new(Instant::now()),
            defaults: config,
        }),
    })
}

struct ClientInner {
    store: RwLock<VectorStore>,
    session: Session,
    wal: WalWriter,
    autosave: Option<AutoSaveConfig>,
    ops_since_save: AtomicU64,
    last_save: parking_lot::Mutex<Instant>,
    defaults: Config,
}

/// Handle to one collection. Cheap to clone; all clones share the same
/// single-writer store.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn config(&self) -> &Config {
        &self.inner.defaults
    }

    /// Inserts or replaces a record. The change is WAL-durable before it
    /// mutates in-memory state.
    pub async fn set(
        &self,
        id: u32,
        vector: &[f32],
        meta: Option<Bytes>,
        upsert: bool,
    ) -> Result<()> {
        let mut store = self.inner.store.write().await;
        if !upsert && store.has(id) {
            return Err(VecliteError::AlreadyExists(id));
        }
        veclite_core::metric::validate_vector(store.table().dim(), vector)?;
        self.inner
            .wal
            .append(&[WalRecord::Upsert {
                id,
                vector: vector.to_vec(),
                meta: meta.clone(),
            }])
            .await?;
        store.add(id, vector, meta, true)?;
        drop(store);
        self.note_write(1).await
    }

    /// Insert-or-replace shorthand.
    pub async fn push(&self, record: Record) -> Result<()> {
        self.set(record.id, &record.vector, record.meta, true).await
    }

    /// Batch upsert in one WAL frame. Returns the number applied.
    pub async fn upsert(&self, records: Vec<Record>) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }
        let mut store = self.inner.store.write().await;
        let dim = store.table().dim();
        for r in &records {
            veclite_core::metric::validate_vector(dim, &r.vector)?;
        }
        let wal_records: Vec<WalRecord> = records
            .iter()
            .map(|r| WalRecord::Upsert {
                id: r.id,
                vector: r.vector.clone(),
                meta: r.meta.clone(),
            })
            .collect();
        self.inner.wal.append(&wal_records).await?;
        let count = records.len();
        for r in records {
            store.add(r.id, &r.vector, r.meta, true)?;
        }
        drop(store);
        self.note_write(count as u64).await?;
        Ok(count)
    }

    pub async fn delete(&self, id: u32) -> Result<bool> {
        let mut store = self.inner.store.write().await;
        if !store.has(id) {
            return Ok(false);
        }
        self.inner.wal.append(&[WalRecord::Remove { id }]).await?;
        store.remove(id);
        drop(store);
        self.note_write(1).await?;
        Ok(true)
    }

    pub async fn set_meta(&self, id: u32, meta: Option<Bytes>) -> Result<()> {
        let mut store = self.inner.store.write().await;
        if !store.has(id) {
            return Err(VecliteError::NotFound(format!("id {id}")));
        }
        self.inner
            .wal
            .append(&[WalRecord::SetMeta {
                id,
                meta: meta.clone(),
            }])
            .await?;
        store.set_meta(id, meta)?;
        drop(store);
        self.note_write(1).await
    }

    pub async fn get(&self, id: u32) -> Option<Record> {
        self.inner.store.read().await.get(id)
    }

    pub async fn has(&self, id: u32) -> bool {
        self.inner.store.read().await.has(id)
    }

    pub async fn size(&self) -> u32 {
        self.inner.store.read().await.len() as u32
    }

    /// Nearest hit, or `None` on an empty store / empty candidate set.
    pub async fn find(&self, query: &[f32], filter: Option<Filter>) -> Result<Option<Hit>> {
        let mut opts = self.search_options(1);
        if let Some(expr) = filter.and_then(Filter::into_expr) {
            opts = opts.filter(expr);
        }
        let hits = self.inner.store.read().await.search(query, &opts)?;
        Ok(hits.into_iter().next())
    }

    /// Top-k search with the configured filter defaults.
    pub async fn find_many(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<Hit>> {
        self.inner.store.read().await.search(query, opts)
    }

    /// Search options seeded from the connection's filter-search config.
    pub fn search_options(&self, k: usize) -> SearchOptions {
        SearchOptions::with_defaults(k, &self.inner.defaults.filter_search)
    }

    /// Persists the current state as a new epoch.
    pub async fn save_state(&self, cancel: Option<&CancelFlag>) -> Result<SaveReport> {
        let mut store = self.inner.store.write().await;
        let report = self.inner.session.save_state(&mut store, cancel).await?;
        self.inner.ops_since_save.store(0, Ordering::Relaxed);
        *self.inner.last_save.lock() = Instant::now();
        Ok(report)
    }

    /// Re-opens the committed state, replacing the in-memory store.
    pub async fn open_state(&self) -> Result<OpenReport> {
        let (store, report) = self.inner.session.open_state().await?;
        *self.inner.store.write().await = store;
        Ok(report)
    }

    /// Re-opens ignoring any ANN payload; the artifact is rebuilt.
    pub async fn rebuild_state(&self) -> Result<OpenReport> {
        let (store, report) = self.inner.session.rebuild_state().await?;
        *self.inner.store.write().await = store;
        Ok(report)
    }

    /// Moves that bring the committed manifest onto `new_map`.
    pub async fn plan_rebalance(&self, new_map: &PlacementMap) -> Result<Vec<Move>> {
        let manifest = self.inner.session.current_manifest().await?;
        Ok(plan_rebalance(&manifest, new_map))
    }

    pub async fn apply_rebalance(
        &self,
        new_map: &PlacementMap,
        moves: &[Move],
        opts: ApplyOptions,
        cancel: Option<&CancelFlag>,
    ) -> Result<RebalanceReport> {
        self.inner
            .session
            .apply_rebalance(new_map, moves, opts, cancel)
            .await
    }

    /// Read access for host-level operations not covered by the client
    /// surface (explicit attribute records, table inspection).
    pub async fn with_store<R>(&self, f: impl FnOnce(&VectorStore) -> R) -> R {
        f(&*self.inner.store.read().await)
    }

    /// Exclusive access; the caller is responsible for WAL durability of
    /// whatever it mutates.
    pub async fn with_store_mut<R>(&self, f: impl FnOnce(&mut VectorStore) -> R) -> R {
        f(&mut *self.inner.store.write().await)
    }

    async fn note_write(&self, ops: u64) -> Result<()> {
        let Some(policy) = &self.inner.autosave else {
            return Ok(());
        };
        let total = self.inner.ops_since_save.fetch_add(ops, Ordering::Relaxed) + ops;
        let elapsed_ms = self.inner.last_save.lock().elapsed().as_millis() as u64;
        if total >= policy.ops_threshold || elapsed_ms >= policy.interval_ms {
            debug!(total, elapsed_ms, "auto-save threshold tripped");
            self.save_state(None).await?;
        }
        Ok(())
    }
}
