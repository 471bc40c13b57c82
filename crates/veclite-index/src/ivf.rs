#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

use crate::bruteforce::TopK;
use crate::table::VectorTable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use tracing::debug;
use veclite_core::config::IvfParams;
use veclite_core::metric::l2_distance;

/// Fixed seed so training is reproducible across processes.
const TRAIN_SEED: u64 = 0x1717;
const MAX_TRAIN_SAMPLE: usize = 16_384;
const MAX_ITERATIONS: usize = 20;
const TOLERANCE: f32 = 1e-4;

/// Removed fraction past which the quantizer is retrained on next save.
pub const RETRAIN_FRAGMENTATION: f64 = 0.3;

/// Coarse quantizer: `nlist` k-means centroids, one inverted list each.
/// Untrained indexes (fewer than `nlist` rows seen) fall back to a full
/// scan at search time.
#[derive(Debug)]
pub struct IvfIndex {
    pub(crate) params: IvfParams,
    pub(crate) dim: usize,
    /// `nlist * dim` when trained, empty before.
    pub(crate) centroids: Vec<f32>,
    pub(crate) lists: Vec<Vec<u32>>,
    pub(crate) list_of: HashMap<u32, u32>,
    pub(crate) trained_rows: usize,
    pub(crate) removed_since_train: usize,
}

impl IvfIndex {
    pub fn new(dim: usize, params: IvfParams) -> Self {
        Self {
            params,
            dim,
            centroids: Vec::new(),
            lists: Vec::new(),
            list_of: HashMap::new(),
            trained_rows: 0,
            removed_since_train: 0,
        }
    }

    pub fn params(&self) -> &IvfParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        !self.centroids.is_empty()
    }

    pub fn needs_rebuild(&self) -> bool {
        self.trained_rows > 0
            && self.removed_since_train as f64 / self.trained_rows as f64 > RETRAIN_FRAGMENTATION
    }

    /// Inserts `id`, training first if the table just became
    /// `nlist`-reachable.
    pub fn insert(&mut self, table: &VectorTable, id: u32) {
        if let Some(list) = self.list_of.remove(&id) {
            // Replacement: drop the stale posting before re-assigning.
            self.lists[list as usize].retain(|&e| e != id);
        }
        if !self.is_trained() {
            if table.len() >= self.params.nlist {
                self.train(table);
            }
            return;
        }
        let Some(v) = table.vector(id) else {
            return;
        };
        let list = self.nearest_centroid(v);
        self.lists[list as usize].push(id);
        self.list_of.insert(id, list);
    }

    pub fn remove(&mut self, id: u32) -> bool {
        let Some(list) = self.list_of.remove(&id) else {
            return false;
        };
        self.lists[list as usize].retain(|&e| e != id);
        self.removed_since_train += 1;
        true
    }

    /// Retrains from scratch on the current table.
    pub fn rebuild(table: &VectorTable, params: IvfParams) -> Self {
        let mut index = Self::new(table.dim(), params);
        if table.len() >= index.params.nlist {
            index.train(table);
        }
        index
    }

    /// Fixed-seed k-means over a bounded sample, then a full assignment
    /// pass.
    pub fn train(&mut self, table: &VectorTable) {
        let rows = table.len();
        if rows == 0 {
            return;
        }
        let nlist = self.params.nlist.min(rows);
        let dim = self.dim;
        let mut rng = StdRng::seed_from_u64(TRAIN_SEED);

        // Bounded training sample, strided deterministically.
        let sample_len = rows.min(MAX_TRAIN_SAMPLE);
        let stride = (rows / sample_len).max(1);
        let sample: Vec<usize> = (0..rows).step_by(stride).take(sample_len).collect();

        // Init: distinct random sample rows as centroids.
        let mut centroids = vec![0.0f32; nlist * dim];
        let mut chosen: Vec<usize> = Vec::with_capacity(nlist);
        while chosen.len() < nlist {
            let pick = sample[rng.gen_range(0..sample.len())];
            if !chosen.contains(&pick) {
                chosen.push(pick);
            }
        }
        for (c, &slot) in chosen.iter().enumerate() {
            centroids[c * dim..(c + 1) * dim].copy_from_slice(table.vector_at(slot));
        }

        let mut assignment = vec![0usize; sample.len()];
        for iter in 0..MAX_ITERATIONS {
            for (i, &slot) in sample.iter().enumerate() {
                assignment[i] = nearest(&centroids, dim, table.vector_at(slot));
            }

            let mut sums = vec![0.0f32; nlist * dim];
            let mut counts = vec![0usize; nlist];
            for (i, &slot) in sample.iter().enumerate() {
                let c = assignment[i];
                counts[c] += 1;
                for (acc, x) in sums[c * dim..(c + 1) * dim]
                    .iter_mut()
                    .zip(table.vector_at(slot))
                {
                    *acc += x;
                }
            }

            let mut shift = 0.0f32;
            for c in 0..nlist {
                if counts[c] == 0 {
                    // Empty cluster: reseed to a random sample row.
                    let slot = sample[rng.gen_range(0..sample.len())];
                    centroids[c * dim..(c + 1) * dim].copy_from_slice(table.vector_at(slot));
                    continue;
                }
                let inv = 1.0 / counts[c] as f32;
                for d in 0..dim {
                    let new = sums[c * dim + d] * inv;
                    let old = centroids[c * dim + d];
                    shift = shift.max((new - old).abs());
                    centroids[c * dim + d] = new;
                }
            }
            if shift < TOLERANCE {
                debug!(iter, "k-means converged");
                break;
            }
        }

        self.centroids = centroids;
        self.lists = vec![Vec::new(); nlist];
        self.list_of.clear();
        for slot in 0..rows {
            let id = table.id_at(slot);
            let list = nearest(&self.centroids, dim, table.vector_at(slot)) as u32;
            self.lists[list as usize].push(id);
            self.list_of.insert(id, list);
        }
        self.trained_rows = rows;
        self.removed_since_train = 0;
        debug!(nlist, rows, "ivf trained");
    }

    fn nearest_centroid(&self, v: &[f32]) -> u32 {
        nearest(&self.centroids, self.dim, v) as u32
    }

    /// Probe order: centroid indices ranked by distance to the query.
    fn probe_order(&self, query: &[f32], nprobe: usize) -> Vec<usize> {
        let nlist = self.lists.len();
        let mut order: Vec<(f32, usize)> = (0..nlist)
            .map(|c| {
                (
                    l2_distance(query, &self.centroids[c * self.dim..(c + 1) * self.dim]),
                    c,
                )
            })
            .collect();
        order.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        order.truncate(nprobe.min(nlist));
        order.into_iter().map(|(_, c)| c).collect()
    }

    /// Probes the `nprobe` nearest lists and ranks candidates exactly.
    /// `accept` applies the compiled filter.
    pub fn search<F>(
        &self,
        table: &VectorTable,
        query: &[f32],
        k: usize,
        nprobe: usize,
        accept: F,
    ) -> Vec<(u32, f32)>
    where
        F: Fn(u32) -> bool + Sync,
    {
        if !self.is_trained() {
            return crate::bruteforce::scan(table, query, k, accept);
        }
        let metric = table.metric();
        let mut top = TopK::new(k);
        for list in self.probe_order(query, nprobe.max(1)) {
            for &id in &self.lists[list] {
                if !accept(id) {
                    continue;
                }
                if let Some(v) = table.vector(id) {
                    top.push(id, metric.score(query, v));
                }
            }
        }
        top.into_sorted()
    }
}

fn nearest(centroids: &[f32], dim: usize, v: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::INFINITY;
    for c in 0..centroids.len() / dim {
        let d = l2_distance(v, &centroids[c * dim..(c + 1) * dim]);
        if d < best_dist {
            best_dist = d;
            best = c;
        }
    }
    best
}
