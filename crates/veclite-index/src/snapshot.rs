#![allow(clippy::cast_possible_truncation)]

use crate::hnsw::{HnswIndex, Node};
use crate::ivf::IvfIndex;
use crate::table::VectorTable;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rkyv::{Archive, Deserialize, Serialize};
use roaring::RoaringBitmap;
use std::collections::HashMap;
use veclite_core::config::{HnswParams, IvfParams};
use veclite_core::{Result, Strategy, VecliteError};

/// Serialized ANN artifact. Re-derivable from the vector table, so a
/// missing or mismatched payload only costs a rebuild.
#[derive(Archive, Deserialize, Serialize)]
#[archive(check_bytes)]
pub struct AnnSnapshot {
    /// Pairs the payload with the table state it was derived from.
    pub fingerprint: u64,
    pub hnsw: Option<HnswSnapshot>,
    pub ivf: Option<IvfSnapshot>,
}

#[derive(Archive, Deserialize, Serialize)]
#[archive(check_bytes)]
pub struct HnswSnapshot {
    pub m: u32,
    pub ef_construction: u32,
    pub ef_search: u32,
    pub seed: u64,
    pub entry: u32,
    pub max_layer: u32,
    pub nodes: Vec<SnapshotNode>,
    /// Roaring-serialized tombstone set over arena indices.
    pub tombstones: Vec<u8>,
}

#[derive(Archive, Deserialize, Serialize)]
#[archive(check_bytes)]
pub struct SnapshotNode {
    pub id: u32,
    pub stash: Option<Vec<f32>>,
    pub layers: Vec<Vec<u32>>,
}

#[derive(Archive, Deserialize, Serialize)]
#[archive(check_bytes)]
pub struct IvfSnapshot {
    pub nlist: u32,
    pub nprobe: u32,
    pub dim: u32,
    pub centroids: Vec<f32>,
    pub lists: Vec<Vec<u32>>,
    pub trained_rows: u64,
    pub removed_since_train: u64,
}

/// Fingerprint over the table identity the artifact was derived from:
/// dim, metric, strategy and the id column in slot order.
pub fn table_fingerprint(table: &VectorTable, strategy: Strategy) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&(table.dim() as u32).to_le_bytes());
    hasher.update(&[metric_tag(table), strategy_tag(strategy)]);
    hasher.update(&(table.len() as u32).to_le_bytes());
    for &id in table.ids() {
        hasher.update(&id.to_le_bytes());
    }
    u64::from_le_bytes(
        hasher.finalize().as_bytes()[..8]
            .try_into()
            .expect("hash is 32 bytes"),
    )
}

fn metric_tag(table: &VectorTable) -> u8 {
    match table.metric() {
        veclite_core::Metric::Cosine => 0,
        veclite_core::Metric::L2 => 1,
        veclite_core::Metric::Dot => 2,
    }
}

fn strategy_tag(strategy: Strategy) -> u8 {
    match strategy {
        Strategy::Bruteforce => 0,
        Strategy::Hnsw => 1,
        Strategy::Ivf => 2,
    }
}

pub fn snapshot_hnsw(index: &HnswIndex) -> Result<HnswSnapshot> {
    let mut tombstones = Vec::new();
    index
        .tombstones
        .serialize_into(&mut tombstones)
        .map_err(|e| VecliteError::Io(std::io::Error::other(e)))?;
    Ok(HnswSnapshot {
        m: index.params.m as u32,
        ef_construction: index.params.ef_construction as u32,
        ef_search: index.params.ef_search as u32,
        seed: index.params.seed,
        entry: index.entry,
        max_layer: index.max_layer as u32,
        nodes: index
            .nodes
            .iter()
            .map(|n| SnapshotNode {
                id: n.id,
                stash: n.stash.clone(),
                layers: n.layers.iter().map(|l| l.to_vec()).collect(),
            })
            .collect(),
        tombstones,
    })
}

pub fn restore_hnsw(snap: &HnswSnapshot) -> Result<HnswIndex> {
    let params = HnswParams {
        m: snap.m as usize,
        ef_construction: snap.ef_construction as usize,
        ef_search: snap.ef_search as usize,
        seed: snap.seed,
    };
    let tombstones = RoaringBitmap::deserialize_from(&snap.tombstones[..])
        .map_err(|e| VecliteError::corrupt(0, format!("tombstone bitmap: {e}")))?;

    let mut node_of_id = HashMap::new();
    let mut nodes = Vec::with_capacity(snap.nodes.len());
    for (idx, s) in snap.nodes.iter().enumerate() {
        if !tombstones.contains(idx as u32) {
            node_of_id.insert(s.id, idx as u32);
        }
        nodes.push(Node {
            id: s.id,
            stash: s.stash.clone(),
            layers: s.layers.iter().map(|l| l.iter().copied().collect()).collect(),
        });
    }

    Ok(HnswIndex {
        // Level stream position is not persisted; derive a fresh one so
        // post-load inserts stay deterministic per (seed, node count).
        level_rng: StdRng::seed_from_u64(snap.seed ^ snap.nodes.len() as u64),
        params,
        nodes,
        node_of_id,
        entry: snap.entry,
        max_layer: snap.max_layer as usize,
        tombstones,
    })
}

pub fn snapshot_ivf(index: &IvfIndex) -> IvfSnapshot {
    IvfSnapshot {
        nlist: index.params.nlist as u32,
        nprobe: index.params.nprobe as u32,
        dim: index.dim as u32,
        centroids: index.centroids.clone(),
        lists: index.lists.clone(),
        trained_rows: index.trained_rows as u64,
        removed_since_train: index.removed_since_train as u64,
    }
}

pub fn restore_ivf(snap: &IvfSnapshot) -> IvfIndex {
    let mut list_of = HashMap::new();
    for (list, ids) in snap.lists.iter().enumerate() {
        for &id in ids {
            list_of.insert(id, list as u32);
        }
    }
    IvfIndex {
        params: IvfParams {
            nlist: snap.nlist as usize,
            nprobe: snap.nprobe as usize,
        },
        dim: snap.dim as usize,
        centroids: snap.centroids.clone(),
        lists: snap.lists.clone(),
        list_of,
        trained_rows: snap.trained_rows as usize,
        removed_since_train: snap.removed_since_train as usize,
    }
}

/// Archives the snapshot with rkyv.
pub fn to_bytes(snapshot: &AnnSnapshot) -> Result<Vec<u8>> {
    let bytes = rkyv::to_bytes::<_, 1024>(snapshot)
        .map_err(|e| VecliteError::Io(std::io::Error::other(format!("ann serialize: {e}"))))?;
    Ok(bytes.into_vec())
}

/// Validates and deserializes an archived snapshot.
pub fn from_bytes(data: &[u8]) -> Result<AnnSnapshot> {
    let archived = rkyv::check_archived_root::<AnnSnapshot>(data)
        .map_err(|e| VecliteError::corrupt(0, format!("ann payload: {e}")))?;
    let snapshot: AnnSnapshot = archived
        .deserialize(&mut rkyv::Infallible)
        .map_err(|e| VecliteError::corrupt(0, format!("ann payload: {e:?}")))?;
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclite_core::Metric;

    #[test]
    fn hnsw_snapshot_round_trip() {
        let mut table = VectorTable::new(2, Metric::L2);
        let mut index = HnswIndex::new(HnswParams {
            m: 6,
            ef_construction: 32,
            ef_search: 16,
            seed: 7,
        });
        for id in 0..20u32 {
            table
                .insert(id, &[id as f32, (id % 3) as f32], None, false)
                .unwrap();
            index.insert(&table, id);
        }
        let v = table.vector(4).unwrap().to_vec();
        index.remove(4, v);

        let snap = AnnSnapshot {
            fingerprint: table_fingerprint(&table, Strategy::Hnsw),
            hnsw: Some(snapshot_hnsw(&index).unwrap()),
            ivf: None,
        };
        let bytes = to_bytes(&snap).unwrap();
        let restored = from_bytes(&bytes).unwrap();
        assert_eq!(restored.fingerprint, snap.fingerprint);

        let graph = restore_hnsw(restored.hnsw.as_ref().unwrap()).unwrap();
        let q = table.vector(10).unwrap().to_vec();
        assert_eq!(
            graph.search(&table, &q, 3, 32),
            index.search(&table, &q, 3, 32)
        );
    }

    #[test]
    fn ivf_snapshot_round_trip() {
        let mut table = VectorTable::new(2, Metric::L2);
        for id in 0..50u32 {
            table
                .insert(id, &[(id % 10) as f32, (id / 10) as f32], None, false)
                .unwrap();
        }
        let index = IvfIndex::rebuild(
            &table,
            IvfParams {
                nlist: 5,
                nprobe: 2,
            },
        );
        let snap = AnnSnapshot {
            fingerprint: table_fingerprint(&table, Strategy::Ivf),
            hnsw: None,
            ivf: Some(snapshot_ivf(&index)),
        };
        let restored = from_bytes(&to_bytes(&snap).unwrap()).unwrap();
        let back = restore_ivf(restored.ivf.as_ref().unwrap());
        assert_eq!(back.centroids, index.centroids);
        assert_eq!(
            back.search(&table, &[3.0, 2.0], 4, 2, |_| true),
            index.search(&table, &[3.0, 2.0], 4, 2, |_| true)
        );
    }

    #[test]
    fn corrupted_payload_is_rejected() {
        let snap = AnnSnapshot {
            fingerprint: 1,
            hnsw: None,
            ivf: None,
        };
        let mut bytes = to_bytes(&snap).unwrap();
        bytes.truncate(bytes.len() / 2);
        assert!(from_bytes(&bytes).is_err());
    }

    #[test]
    fn fingerprint_tracks_id_column() {
        let mut table = VectorTable::new(2, Metric::L2);
        table.insert(1, &[0.0, 0.0], None, false).unwrap();
        let a = table_fingerprint(&table, Strategy::Hnsw);
        table.insert(2, &[1.0, 1.0], None, false).unwrap();
        let b = table_fingerprint(&table, Strategy::Hnsw);
        assert_ne!(a, b);
        assert_ne!(a, table_fingerprint(&table, Strategy::Ivf));
    }
}
