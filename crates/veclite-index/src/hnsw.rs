#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]

use crate::table::VectorTable;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use roaring::RoaringBitmap;
use smallvec::SmallVec;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use veclite_core::config::{FilterMode, HnswParams, SeedCount, SeedStrategy};

/// Arena index of a graph node.
pub type NodeId = u32;

const MAX_LAYERS: usize = 16;

/// Tombstone fraction past which the graph is rebuilt on the next save.
pub const REBUILD_TOMBSTONE_RATIO: f64 = 0.3;

/// Nearest-neighbor candidate. The heap is a max-heap, so `Ord` is
/// reversed to make it behave as a min-heap on distance.
#[derive(Debug, Copy, Clone, PartialEq)]
struct Candidate {
    node: NodeId,
    dist: f32,
}

impl Eq for Candidate {}
impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .dist
            .total_cmp(&self.dist)
            .then_with(|| other.node.cmp(&self.node))
    }
}
impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Node {
    /// Record id this node indexes.
    pub id: u32,
    /// Vector snapshot kept after the table row is gone, so traversal can
    /// still pass through the tombstone until the next rebuild.
    pub stash: Option<Vec<f32>>,
    /// Neighbor lists by layer; `layers[0]` is the dense base layer.
    pub layers: Vec<SmallVec<[NodeId; 16]>>,
}

/// Knobs for one filtered traversal.
#[derive(Debug, Clone, Copy)]
pub struct TraversalOpts {
    pub mode: FilterMode,
    pub bridge_budget: usize,
    pub seeds: SeedCount,
    pub seed_strategy: SeedStrategy,
    pub adaptive_ef: bool,
    pub early_stop_margin: Option<f32>,
}

/// Layered proximity graph over the vector table.
///
/// Construction is incremental and deterministic for a fixed seed and
/// insert order. Deletion tombstones nodes; a rebuild purges them.
#[derive(Debug)]
pub struct HnswIndex {
    pub(crate) params: HnswParams,
    pub(crate) nodes: Vec<Node>,
    pub(crate) node_of_id: HashMap<u32, NodeId>,
    pub(crate) entry: NodeId,
    pub(crate) max_layer: usize,
    pub(crate) tombstones: RoaringBitmap,
    pub(crate) level_rng: StdRng,
}

impl HnswIndex {
    pub fn new(params: HnswParams) -> Self {
        Self {
            level_rng: StdRng::seed_from_u64(params.seed),
            params,
            nodes: Vec::new(),
            node_of_id: HashMap::new(),
            entry: 0,
            max_layer: 0,
            tombstones: RoaringBitmap::new(),
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    pub fn live_len(&self) -> usize {
        self.node_of_id.len()
    }

    pub fn tombstone_ratio(&self) -> f64 {
        if self.nodes.is_empty() {
            0.0
        } else {
            self.tombstones.len() as f64 / self.nodes.len() as f64
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        self.tombstone_ratio() > REBUILD_TOMBSTONE_RATIO
    }

    /// Rebuilds a fresh graph from the table, purging tombstones.
    pub fn rebuild(table: &VectorTable, params: HnswParams) -> Self {
        let mut index = Self::new(params);
        for slot in 0..table.len() {
            index.insert(table, table.id_at(slot));
        }
        index
    }

    /// `⌊−ln(U(0,1]) · 1/ln(M)⌋`, capped at the layer budget.
    fn random_level(&mut self) -> usize {
        let u: f64 = 1.0 - self.level_rng.gen::<f64>(); // (0, 1]
        let level = (-u.ln() * (1.0 / (self.params.m as f64).ln())) as usize;
        level.min(MAX_LAYERS - 1)
    }

    fn node_vector<'a>(&'a self, table: &'a VectorTable, node: NodeId) -> Option<&'a [f32]> {
        let n = &self.nodes[node as usize];
        n.stash.as_deref().or_else(|| table.vector(n.id))
    }

    #[inline]
    fn dist(&self, table: &VectorTable, query: &[f32], node: NodeId) -> f32 {
        match self.node_vector(table, node) {
            Some(v) => -table.metric().score(query, v),
            None => f32::INFINITY,
        }
    }

    #[inline]
    fn is_live(&self, node: NodeId) -> bool {
        !self.tombstones.contains(node)
    }

    /// Tombstones the node for `id`. The vector snapshot keeps the node
    /// traversable after the table row disappears.
    pub fn remove(&mut self, id: u32, vector: Vec<f32>) -> bool {
        let Some(node) = self.node_of_id.remove(&id) else {
            return false;
        };
        self.nodes[node as usize].stash = Some(vector);
        self.tombstones.insert(node);
        true
    }

    /// Inserts (or re-inserts after an in-place vector change) `id`. An
    /// existing node for the id is tombstoned first.
    pub fn insert(&mut self, table: &VectorTable, id: u32) {
        if let Some(&old) = self.node_of_id.get(&id) {
            // Replacement: the old position no longer matches the vector.
            let stash = self
                .node_vector(table, old)
                .map(<[f32]>::to_vec)
                .unwrap_or_default();
            self.nodes[old as usize].stash = Some(stash);
            self.tombstones.insert(old);
            self.node_of_id.remove(&id);
        }
        let Some(query) = table.vector(id).map(<[f32]>::to_vec) else {
            return;
        };

        let level = self.random_level();
        let node = self.nodes.len() as NodeId;
        self.nodes.push(Node {
            id,
            stash: None,
            layers: vec![SmallVec::new(); level + 1],
        });
        self.node_of_id.insert(id, node);

        if self.nodes.len() == 1 {
            self.entry = node;
            self.max_layer = level;
            return;
        }

        // Phase 1: greedy zoom-in from the entry point down to level+1.
        let mut curr = self.entry;
        let mut curr_dist = self.dist(table, &query, curr);
        for layer in ((level + 1)..=self.max_layer).rev() {
            loop {
                let mut improved = false;
                let neighbors = self.neighbors_at(curr, layer);
                for &n in &neighbors {
                    let d = self.dist(table, &query, n);
                    if d < curr_dist {
                        curr_dist = d;
                        curr = n;
                        improved = true;
                    }
                }
                if !improved {
                    break;
                }
            }
        }

        // Phase 2: beam search and bidirectional linking per layer.
        for layer in (0..=level.min(self.max_layer)).rev() {
            let m_max = self.m_max(layer);
            let candidates = self.search_layer(table, &query, curr, layer, self.params.ef_construction);
            let selected = self.select_neighbors(table, candidates, m_max);
            for &n in &selected {
                self.add_link(node, n, layer);
                self.add_link(n, node, layer);
                let fanout = self.nodes[n as usize]
                    .layers
                    .get(layer)
                    .map_or(0, SmallVec::len);
                if fanout > m_max {
                    self.prune_connections(table, n, layer, m_max);
                }
            }
            if let Some(&first) = selected.first() {
                curr = first;
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry = node;
        }
    }

    /// Base layer is kept twice as dense for recall.
    fn m_max(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m * 2
        } else {
            self.params.m
        }
    }

    fn neighbors_at(&self, node: NodeId, layer: usize) -> SmallVec<[NodeId; 16]> {
        self.nodes
            .get(node as usize)
            .and_then(|n| n.layers.get(layer))
            .cloned()
            .unwrap_or_default()
    }

    fn add_link(&mut self, src: NodeId, dst: NodeId, layer: usize) {
        if src == dst {
            return;
        }
        let Some(node) = self.nodes.get_mut(src as usize) else {
            return;
        };
        let Some(links) = node.layers.get_mut(layer) else {
            return;
        };
        if !links.contains(&dst) {
            links.push(dst);
        }
    }

    /// Beam search on one layer; returns up to `ef` nearest candidates.
    fn search_layer(
        &self,
        table: &VectorTable,
        query: &[f32],
        start: NodeId,
        layer: usize,
        ef: usize,
    ) -> BinaryHeap<Candidate> {
        let mut visited = RoaringBitmap::new();
        let mut candidates = BinaryHeap::with_capacity(ef.max(16));
        // Max-heap on distance: worst kept candidate on top.
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> =
            BinaryHeap::with_capacity(ef.max(16));

        let first = Candidate {
            node: start,
            dist: self.dist(table, query, start),
        };
        candidates.push(first);
        results.push(std::cmp::Reverse(first));
        visited.insert(start);

        while let Some(cand) = candidates.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
            if cand.dist > worst && results.len() >= ef {
                break;
            }
            for &neighbor in &self.neighbors_at(cand.node, layer) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.dist(table, query, neighbor);
                let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
                if results.len() < ef || dist < worst {
                    let c = Candidate {
                        node: neighbor,
                        dist,
                    };
                    candidates.push(c);
                    results.push(std::cmp::Reverse(c));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
        results.into_iter().map(|r| r.0).collect()
    }

    /// Shrink-by-distance selection heuristic: a candidate is kept only
    /// if no already-kept neighbor is closer to it than the query is.
    fn select_neighbors(
        &self,
        table: &VectorTable,
        candidates: BinaryHeap<Candidate>,
        m: usize,
    ) -> Vec<NodeId> {
        let mut sorted = candidates.into_vec();
        sorted.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.node.cmp(&b.node)));

        let mut result: Vec<NodeId> = Vec::with_capacity(m);
        for cand in sorted {
            if result.len() >= m {
                break;
            }
            if !self.is_live(cand.node) {
                continue;
            }
            let Some(cand_vec) = self.node_vector(table, cand.node) else {
                continue;
            };
            let mut keep = true;
            for &kept in &result {
                if let Some(kept_vec) = self.node_vector(table, kept) {
                    let between = -table.metric().score(cand_vec, kept_vec);
                    if between < cand.dist {
                        keep = false;
                        break;
                    }
                }
            }
            if keep {
                result.push(cand.node);
            }
        }
        result
    }

    fn prune_connections(&mut self, table: &VectorTable, node: NodeId, layer: usize, m_max: usize) {
        let Some(origin) = self.node_vector(table, node).map(<[f32]>::to_vec) else {
            return;
        };
        let links = self.neighbors_at(node, layer);
        let mut heap = BinaryHeap::with_capacity(links.len());
        for &n in &links {
            heap.push(Candidate {
                node: n,
                dist: self.dist(table, &origin, n),
            });
        }
        let keepers = self.select_neighbors(table, heap, m_max);
        if let Some(links) = self.nodes[node as usize].layers.get_mut(layer) {
            *links = keepers.into_iter().collect();
        }
    }

    /// Unfiltered search: greedy descent then a base-layer beam with
    /// `ef = max(ef_search, k)`. Tombstones are traversed but never
    /// returned. Hits are `(record id, score)`, best first.
    pub fn search(&self, table: &VectorTable, query: &[f32], k: usize, ef: usize) -> Vec<(u32, f32)> {
        if self.nodes.is_empty() || k == 0 {
            return Vec::new();
        }
        let ef = ef.max(k);
        let start = self.descend(table, query);
        let found = self.search_layer(table, query, start, 0, ef);
        self.collect_hits(found, k, |node| self.is_live(node))
    }

    fn descend(&self, table: &VectorTable, query: &[f32]) -> NodeId {
        let mut curr = self.entry;
        let mut curr_dist = self.dist(table, query, curr);
        for layer in (1..=self.max_layer).rev() {
            loop {
                let mut improved = false;
                for &n in &self.neighbors_at(curr, layer) {
                    let d = self.dist(table, query, n);
                    if d < curr_dist {
                        curr_dist = d;
                        curr = n;
                        improved = true;
                    }
                }
                if !improved {
                    break;
                }
            }
        }
        curr
    }

    fn collect_hits<F: Fn(NodeId) -> bool>(
        &self,
        found: BinaryHeap<Candidate>,
        k: usize,
        admit: F,
    ) -> Vec<(u32, f32)> {
        let mut hits: Vec<(u32, f32)> = found
            .into_iter()
            .filter(|c| admit(c.node) && c.dist.is_finite())
            .map(|c| (self.nodes[c.node as usize].id, -c.dist))
            .collect();
        hits.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        hits.truncate(k);
        hits
    }

    /// Filtered search.
    ///
    /// Hard mode restricts traversal to the candidate set, seeding from
    /// it; soft mode traverses freely but admits only accepted ids and
    /// spends `bridge_budget` expansions on out-of-set nodes before
    /// contracting to hard behavior.
    pub fn search_filtered(
        &self,
        table: &VectorTable,
        query: &[f32],
        k: usize,
        ef: usize,
        candidates: Option<&RoaringBitmap>,
        accept: &dyn Fn(u32) -> bool,
        opts: &TraversalOpts,
    ) -> Vec<(u32, f32)> {
        if self.nodes.is_empty() || k == 0 {
            return Vec::new();
        }
        let ef = ef.max(k);
        match (opts.mode, candidates) {
            (FilterMode::Hard, Some(set)) => {
                self.search_hard(table, query, k, ef, set, accept, opts)
            }
            // Hard mode without a finite preselection degenerates to an
            // admission-filtered soft search with no bridging allowance.
            (FilterMode::Hard, None) => {
                let hard = TraversalOpts {
                    bridge_budget: usize::MAX,
                    ..*opts
                };
                self.search_soft(table, query, k, ef, accept, &hard)
            }
            (FilterMode::Soft, _) => self.search_soft(table, query, k, ef, accept, opts),
        }
    }

    fn seed_nodes(
        &self,
        table: &VectorTable,
        query: &[f32],
        set: &RoaringBitmap,
        opts: &TraversalOpts,
    ) -> Vec<NodeId> {
        if set.is_empty() {
            return Vec::new();
        }
        let want = match opts.seeds {
            SeedCount::Auto => (set.len() as usize).min(32),
            SeedCount::Fixed(n) => n.max(1),
        };
        let card = set.len() as u32;
        let mut picked: Vec<NodeId> = Vec::with_capacity(want);
        match opts.seed_strategy {
            SeedStrategy::Random => {
                let mut rng = StdRng::seed_from_u64(self.params.seed ^ u64::from(card));
                let mut seen = RoaringBitmap::new();
                let attempts = want * 4;
                for _ in 0..attempts {
                    if picked.len() >= want {
                        break;
                    }
                    let nth = rng.gen_range(0..card);
                    if let Some(id) = set.select(nth) {
                        if seen.insert(id) {
                            if let Some(&node) = self.node_of_id.get(&id) {
                                picked.push(node);
                            }
                        }
                    }
                }
            }
            SeedStrategy::Nearest => {
                // Score an evenly strided sample and keep the nearest.
                let sample = (card as usize).min(1024);
                let stride = (card as usize / sample).max(1) as u32;
                let mut scored: Vec<Candidate> = Vec::with_capacity(sample);
                let mut nth = 0u32;
                while (nth as usize) < card as usize && scored.len() < sample {
                    if let Some(id) = set.select(nth) {
                        if let Some(&node) = self.node_of_id.get(&id) {
                            scored.push(Candidate {
                                node,
                                dist: self.dist(table, query, node),
                            });
                        }
                    }
                    nth += stride;
                }
                scored.sort_by(|a, b| a.dist.total_cmp(&b.dist).then(a.node.cmp(&b.node)));
                picked.extend(scored.into_iter().take(want).map(|c| c.node));
            }
        }
        picked
    }

    fn search_hard(
        &self,
        table: &VectorTable,
        query: &[f32],
        k: usize,
        ef: usize,
        set: &RoaringBitmap,
        accept: &dyn Fn(u32) -> bool,
        opts: &TraversalOpts,
    ) -> Vec<(u32, f32)> {
        let seeds = self.seed_nodes(table, query, set, opts);
        if seeds.is_empty() {
            return Vec::new();
        }

        let mut visited = RoaringBitmap::new();
        let mut frontier = BinaryHeap::with_capacity(ef);
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> = BinaryHeap::with_capacity(ef);

        for node in seeds {
            if !visited.insert(node) {
                continue;
            }
            let c = Candidate {
                node,
                dist: self.dist(table, query, node),
            };
            frontier.push(c);
            if self.is_live(node) && accept(self.nodes[node as usize].id) {
                results.push(std::cmp::Reverse(c));
            }
        }

        while let Some(cand) = frontier.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
            if cand.dist > worst && results.len() >= ef {
                break;
            }
            for &neighbor in &self.neighbors_at(cand.node, 0) {
                // Restricted traversal: never leave the candidate set.
                if !set.contains(self.nodes[neighbor as usize].id) {
                    continue;
                }
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.dist(table, query, neighbor);
                let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
                if results.len() < ef || dist < worst {
                    let c = Candidate {
                        node: neighbor,
                        dist,
                    };
                    frontier.push(c);
                    if self.is_live(neighbor) && accept(self.nodes[neighbor as usize].id) {
                        results.push(std::cmp::Reverse(c));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }
        // Frontier may empty before k hits exist; return what was found.
        self.collect_hits(results.into_iter().map(|r| r.0).collect(), k, |_| true)
    }

    fn search_soft(
        &self,
        table: &VectorTable,
        query: &[f32],
        k: usize,
        ef: usize,
        accept: &dyn Fn(u32) -> bool,
        opts: &TraversalOpts,
    ) -> Vec<(u32, f32)> {
        let start = self.descend(table, query);
        let max_ef = ef * 8;
        let mut current_ef = ef;
        let mut bridges_left = opts.bridge_budget;
        let mut expansions = 0usize;

        let mut visited = RoaringBitmap::new();
        let mut frontier = BinaryHeap::with_capacity(current_ef);
        let mut results: BinaryHeap<std::cmp::Reverse<Candidate>> =
            BinaryHeap::with_capacity(current_ef);

        let admit = |node: NodeId| self.is_live(node) && accept(self.nodes[node as usize].id);

        let first = Candidate {
            node: start,
            dist: self.dist(table, query, start),
        };
        visited.insert(start);
        frontier.push(first);
        if admit(start) {
            results.push(std::cmp::Reverse(first));
        }

        while let Some(cand) = frontier.pop() {
            let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
            if cand.dist > worst && results.len() >= current_ef {
                break;
            }
            // Early stop: the worst kept hit already beats the closest
            // frontier entry by the margin (scores are negated dists).
            if let Some(margin) = opts.early_stop_margin {
                if results.len() >= k && cand.dist > worst + margin {
                    break;
                }
            }

            let in_set = admit(cand.node);
            if !in_set {
                // Out-of-set expansion consumes the bridge budget; once
                // spent the search contracts to hard mode.
                if bridges_left == 0 {
                    continue;
                }
                bridges_left -= 1;
            }
            expansions += 1;

            for &neighbor in &self.neighbors_at(cand.node, 0) {
                if !visited.insert(neighbor) {
                    continue;
                }
                let dist = self.dist(table, query, neighbor);
                let worst = results.peek().map_or(f32::INFINITY, |r| r.0.dist);
                if results.len() < current_ef || dist < worst {
                    let c = Candidate {
                        node: neighbor,
                        dist,
                    };
                    frontier.push(c);
                    if admit(neighbor) {
                        results.push(std::cmp::Reverse(c));
                        if results.len() > current_ef {
                            results.pop();
                        }
                    }
                }
            }

            // Recall looks low: widen the beam and keep going.
            if opts.adaptive_ef
                && expansions >= current_ef
                && results.len() < k / 2
                && current_ef < max_ef
            {
                current_ef *= 2;
                tracing::debug!(ef = current_ef, "adaptive ef widened");
            }
        }
        self.collect_hits(results.into_iter().map(|r| r.0).collect(), k, |_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclite_core::Metric;

    fn build(n: u32, seed: u64) -> (VectorTable, HnswIndex) {
        let mut table = VectorTable::new(2, Metric::L2);
        let mut index = HnswIndex::new(HnswParams {
            m: 8,
            ef_construction: 64,
            ef_search: 32,
            seed,
        });
        for id in 0..n {
            let angle = f64::from(id) * 0.37;
            table
                .insert(id, &[angle.cos() as f32, angle.sin() as f32], None, false)
                .unwrap();
            index.insert(&table, id);
        }
        (table, index)
    }

    #[test]
    fn finds_exact_match_for_inserted_vectors() {
        let (table, index) = build(60, 7);
        for id in [0u32, 17, 42] {
            let q = table.vector(id).unwrap().to_vec();
            let hits = index.search(&table, &q, 1, 64);
            assert_eq!(hits[0].0, id, "nearest to its own vector");
        }
    }

    #[test]
    fn deterministic_for_fixed_seed() {
        let (table_a, index_a) = build(50, 99);
        let (_, index_b) = build(50, 99);
        let q = [0.5, 0.5];
        assert_eq!(
            index_a.search(&table_a, &q, 5, 32),
            index_b.search(&table_a, &q, 5, 32)
        );
    }

    #[test]
    fn tombstoned_ids_never_surface() {
        let (mut table, mut index) = build(30, 1);
        let victim = index.search(&table, &[1.0, 0.0], 1, 32)[0].0;
        let v = table.vector(victim).unwrap().to_vec();
        index.remove(victim, v);
        table.remove(victim);
        let hits = index.search(&table, &[1.0, 0.0], 10, 64);
        assert!(hits.iter().all(|h| h.0 != victim));
    }

    #[test]
    fn rebuild_threshold_trips_past_ratio() {
        let (mut table, mut index) = build(10, 3);
        for id in 0..4u32 {
            let v = table.vector(id).unwrap().to_vec();
            index.remove(id, v);
            table.remove(id);
        }
        assert!(index.needs_rebuild());
        let rebuilt = HnswIndex::rebuild(&table, *index.params());
        assert_eq!(rebuilt.tombstone_ratio(), 0.0);
        assert_eq!(rebuilt.live_len(), 6);
    }

    #[test]
    fn hard_mode_stays_inside_candidates() {
        let (table, index) = build(40, 7);
        let set: RoaringBitmap = [3u32, 9, 21].into_iter().collect();
        let opts = TraversalOpts {
            mode: FilterMode::Hard,
            bridge_budget: 0,
            seeds: SeedCount::Auto,
            seed_strategy: SeedStrategy::Random,
            adaptive_ef: false,
            early_stop_margin: None,
        };
        let hits = index.search_filtered(
            &table,
            &[1.0, 0.0],
            10,
            16,
            Some(&set),
            &|id| set.contains(id),
            &opts,
        );
        assert!(!hits.is_empty());
        assert!(hits.iter().all(|h| set.contains(h.0)));
    }

    #[test]
    fn soft_mode_admits_only_accepted() {
        let (table, index) = build(40, 7);
        let opts = TraversalOpts {
            mode: FilterMode::Soft,
            bridge_budget: 64,
            seeds: SeedCount::Auto,
            seed_strategy: SeedStrategy::Random,
            adaptive_ef: true,
            early_stop_margin: None,
        };
        let hits =
            index.search_filtered(&table, &[0.0, 1.0], 5, 16, None, &|id| id % 2 == 0, &opts);
        assert!(hits.iter().all(|h| h.0 % 2 == 0));
    }
}
