#![warn(clippy::pedantic)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]

pub mod attrs;
pub mod bruteforce;
pub mod filter_eval;
pub mod hnsw;
pub mod ivf;
pub mod search;
pub mod snapshot;
pub mod table;

pub use search::{Hit, SearchOptions};
pub use table::{Upserted, VectorTable};

use attrs::AttributeIndex;
use bytes::Bytes;
use hnsw::HnswIndex;
use ivf::IvfIndex;
use veclite_core::filter::{AttrPayload, AttrValue};
use veclite_core::{AttrRecord, DatabaseConfig, Result, Strategy, VecliteError};
use veclite_store::wal::WalRecord;

/// The ANN artifact backing a store; re-derivable from the table.
#[derive(Debug)]
pub enum Ann {
    Bruteforce,
    Hnsw(HnswIndex),
    Ivf(IvfIndex),
}

/// One full record as returned to callers.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: u32,
    pub vector: Vec<f32>,
    pub meta: Option<Bytes>,
}

/// In-memory vector store: dense table + ANN strategy + attribute index.
///
/// All mutation is `&mut self`; the write path serializes callers above
/// this layer, and readers between mutations observe a consistent
/// snapshot.
#[derive(Debug)]
pub struct VectorStore {
    pub(crate) config: DatabaseConfig,
    pub(crate) table: VectorTable,
    pub(crate) attrs: AttributeIndex,
    pub(crate) ann: Ann,
}

impl VectorStore {
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        if config.dim == 0 {
            return Err(VecliteError::InvalidVector("dim must be positive".into()));
        }
        let ann = match config.strategy {
            Strategy::Bruteforce => Ann::Bruteforce,
            Strategy::Hnsw => Ann::Hnsw(HnswIndex::new(config.hnsw)),
            Strategy::Ivf => Ann::Ivf(IvfIndex::new(config.dim, config.ivf)),
        };
        Ok(Self {
            table: VectorTable::new(config.dim, config.metric),
            attrs: AttributeIndex::new(config.attrs),
            config,
            ann,
        })
    }

    /// Rebuilds the table and attribute index from decoded segment rows.
    /// The ANN artifact is left empty: the open path either loads the
    /// serialized payload or calls [`Self::rebuild_ann`].
    pub fn from_rows<I>(config: DatabaseConfig, rows: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, Vec<f32>, Option<Bytes>)>,
    {
        let mut store = Self::new(config)?;
        for (id, vector, meta) in rows {
            store.table.insert(id, &vector, meta.clone(), true)?;
            store.attrs.set_attrs(id, derive_attrs(meta.as_deref()));
        }
        Ok(store)
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn table(&self) -> &VectorTable {
        &self.table
    }

    pub fn attr_index(&self) -> &AttributeIndex {
        &self.attrs
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn has(&self, id: u32) -> bool {
        self.table.has(id)
    }

    /// Inserts or (with `upsert`) replaces a record and maintains the
    /// ANN artifact and attribute index.
    pub fn add(&mut self, id: u32, vector: &[f32], meta: Option<Bytes>, upsert: bool) -> Result<Upserted> {
        let outcome = self.table.insert(id, vector, meta.clone(), upsert)?;
        match &mut self.ann {
            Ann::Bruteforce => {}
            Ann::Hnsw(h) => h.insert(&self.table, id),
            Ann::Ivf(v) => v.insert(&self.table, id),
        }
        self.attrs.set_attrs(id, derive_attrs(meta.as_deref()));
        Ok(outcome)
    }

    /// Swap-with-last removal across table, ANN and attributes.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(vector) = self.table.vector(id).map(<[f32]>::to_vec) else {
            return false;
        };
        match &mut self.ann {
            Ann::Bruteforce => {}
            Ann::Hnsw(h) => {
                h.remove(id, vector);
            }
            Ann::Ivf(v) => {
                v.remove(id);
            }
        }
        self.attrs.remove(id);
        self.table.remove(id)
    }

    pub fn get(&self, id: u32) -> Option<Record> {
        let vector = self.table.vector(id)?.to_vec();
        Some(Record {
            id,
            vector,
            meta: self.table.meta(id).flatten().cloned(),
        })
    }

    pub fn get_meta(&self, id: u32) -> Option<Option<Bytes>> {
        self.table.meta(id).map(|m| m.cloned())
    }

    pub fn set_meta(&mut self, id: u32, meta: Option<Bytes>) -> Result<()> {
        self.table.set_meta(id, meta.clone())?;
        self.attrs.set_attrs(id, derive_attrs(meta.as_deref()));
        Ok(())
    }

    pub fn set_vector(&mut self, id: u32, vector: &[f32], upsert: bool) -> Result<Upserted> {
        let outcome = self.table.set_vector(id, vector, upsert)?;
        match &mut self.ann {
            Ann::Bruteforce => {}
            Ann::Hnsw(h) => h.insert(&self.table, id),
            Ann::Ivf(v) => v.insert(&self.table, id),
        }
        Ok(outcome)
    }

    /// Replaces the attribute record for `id`, overriding whatever was
    /// derived from its meta.
    pub fn set_attrs(&mut self, id: u32, attrs: Option<AttrRecord>) -> Result<()> {
        if !self.table.has(id) {
            return Err(VecliteError::NotFound(format!("id {id}")));
        }
        self.attrs.set_attrs(id, attrs);
        Ok(())
    }

    pub fn search(&self, query: &[f32], opts: &SearchOptions) -> Result<Vec<Hit>> {
        search::search(self, query, opts)
    }

    /// Applies one WAL record. Idempotent: upserts replace-or-insert,
    /// removes ignore missing ids, set-meta skips missing ids.
    pub fn apply_wal_record(&mut self, record: &WalRecord) -> Result<()> {
        match record {
            WalRecord::Upsert { id, vector, meta } => {
                self.add(*id, vector, meta.clone(), true)?;
            }
            WalRecord::Remove { id } => {
                self.remove(*id);
            }
            WalRecord::SetMeta { id, meta } => {
                if self.table.has(*id) {
                    self.set_meta(*id, meta.clone())?;
                }
            }
        }
        Ok(())
    }

    /// Whether the ANN artifact has degraded enough (tombstones,
    /// fragmentation) to warrant a rebuild at the next save.
    pub fn ann_needs_rebuild(&self) -> bool {
        match &self.ann {
            Ann::Bruteforce => false,
            Ann::Hnsw(h) => h.needs_rebuild(),
            Ann::Ivf(v) => v.needs_rebuild(),
        }
    }

    /// Rebuilds the ANN artifact from the table, purging tombstones.
    pub fn rebuild_ann(&mut self) {
        self.ann = match &self.ann {
            Ann::Bruteforce => Ann::Bruteforce,
            Ann::Hnsw(h) => Ann::Hnsw(HnswIndex::rebuild(&self.table, *h.params())),
            Ann::Ivf(v) => Ann::Ivf(IvfIndex::rebuild(&self.table, *v.params())),
        };
    }

    /// Serialized ANN payload, or `None` when the strategy carries no
    /// artifact.
    pub fn ann_to_bytes(&self) -> Result<Option<Vec<u8>>> {
        let snap = match &self.ann {
            Ann::Bruteforce => return Ok(None),
            Ann::Hnsw(h) => snapshot::AnnSnapshot {
                fingerprint: snapshot::table_fingerprint(&self.table, Strategy::Hnsw),
                hnsw: Some(snapshot::snapshot_hnsw(h)?),
                ivf: None,
            },
            Ann::Ivf(v) => snapshot::AnnSnapshot {
                fingerprint: snapshot::table_fingerprint(&self.table, Strategy::Ivf),
                hnsw: None,
                ivf: Some(snapshot::snapshot_ivf(v)),
            },
        };
        snapshot::to_bytes(&snap).map(Some)
    }

    /// Loads a serialized ANN payload. Returns false (leaving the
    /// current artifact untouched) when the payload does not match this
    /// table; the caller should rebuild instead.
    pub fn ann_from_bytes(&mut self, data: &[u8]) -> Result<bool> {
        let snap = snapshot::from_bytes(data)?;
        let expected = snapshot::table_fingerprint(&self.table, self.config.strategy);
        if snap.fingerprint != expected {
            return Ok(false);
        }
        match (self.config.strategy, snap.hnsw, snap.ivf) {
            (Strategy::Hnsw, Some(h), _) => {
                self.ann = Ann::Hnsw(snapshot::restore_hnsw(&h)?);
                Ok(true)
            }
            (Strategy::Ivf, _, Some(v)) => {
                self.ann = Ann::Ivf(snapshot::restore_ivf(&v));
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Derives an attribute record from a meta blob: JSON objects index
/// their scalar and scalar-array fields; anything else yields no
/// attributes. Explicit `set_attrs` overrides the derivation.
fn derive_attrs(meta: Option<&[u8]>) -> Option<AttrRecord> {
    let value: serde_json::Value = serde_json::from_slice(meta?).ok()?;
    let obj = value.as_object()?;
    let mut record = AttrRecord::new();
    for (key, v) in obj {
        let payload = match v {
            serde_json::Value::Null => Some(AttrPayload::Null),
            serde_json::Value::Array(items) => {
                let values: Vec<AttrValue> =
                    items.iter().filter_map(json_scalar).collect();
                if values.is_empty() {
                    None
                } else {
                    Some(AttrPayload::Many(values))
                }
            }
            other => json_scalar(other).map(AttrPayload::One),
        };
        if let Some(p) = payload {
            record.insert(key.clone(), p);
        }
    }
    if record.is_empty() {
        None
    } else {
        Some(record)
    }
}

fn json_scalar(v: &serde_json::Value) -> Option<AttrValue> {
    match v {
        serde_json::Value::Bool(b) => Some(AttrValue::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(AttrValue::Int(i))
            } else {
                n.as_f64().map(AttrValue::Float)
            }
        }
        serde_json::Value::String(s) => Some(AttrValue::Str(s.clone())),
        _ => None,
    }
}
