use crate::table::VectorTable;
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Scan rows in parallel once the table is past this size.
const PARALLEL_THRESHOLD: usize = 8192;

/// Ranked entry: greater = better (higher score, then smaller id).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Ranked {
    pub id: u32,
    pub score: f32,
}

impl Eq for Ranked {}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Bounded top-k collector over a min-heap of the kept entries.
#[derive(Debug)]
pub(crate) struct TopK {
    k: usize,
    heap: BinaryHeap<std::cmp::Reverse<Ranked>>,
}

impl TopK {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            heap: BinaryHeap::with_capacity(k + 1),
        }
    }

    pub fn push(&mut self, id: u32, score: f32) {
        if self.k == 0 {
            return;
        }
        self.heap.push(std::cmp::Reverse(Ranked { id, score }));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Worst kept score, once the collector is full.
    pub fn floor(&self) -> Option<f32> {
        if self.heap.len() < self.k {
            None
        } else {
            self.heap.peek().map(|r| r.0.score)
        }
    }

    /// Best-first ordering: descending score, ties to the smaller id.
    pub fn into_sorted(self) -> Vec<(u32, f32)> {
        let mut out: Vec<Ranked> = self.heap.into_iter().map(|r| r.0).collect();
        out.sort_by(|a, b| b.cmp(a));
        out.into_iter().map(|r| (r.id, r.score)).collect()
    }
}

/// Exact top-k scan. Always correct; the recall oracle for the
/// approximate strategies. `accept` prunes rows before scoring.
pub fn scan<F>(table: &VectorTable, query: &[f32], k: usize, accept: F) -> Vec<(u32, f32)>
where
    F: Fn(u32) -> bool + Sync,
{
    let metric = table.metric();
    if table.len() >= PARALLEL_THRESHOLD {
        use rayon::prelude::*;
        let chunks: Vec<Vec<(u32, f32)>> = (0..table.len())
            .into_par_iter()
            .fold(
                || TopK::new(k),
                |mut top, slot| {
                    let id = table.id_at(slot);
                    if accept(id) {
                        top.push(id, metric.score(query, table.vector_at(slot)));
                    }
                    top
                },
            )
            .map(TopK::into_sorted)
            .collect();
        let mut merged = TopK::new(k);
        for chunk in chunks {
            for (id, score) in chunk {
                merged.push(id, score);
            }
        }
        return merged.into_sorted();
    }

    let mut top = TopK::new(k);
    for slot in 0..table.len() {
        let id = table.id_at(slot);
        if accept(id) {
            top.push(id, metric.score(query, table.vector_at(slot)));
        }
    }
    top.into_sorted()
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclite_core::Metric;

    #[test]
    fn scan_ranks_by_score_then_id() {
        let mut table = VectorTable::new(2, Metric::Dot);
        table.insert(5, &[1.0, 0.0], None, false).unwrap();
        table.insert(2, &[1.0, 0.0], None, false).unwrap();
        table.insert(9, &[0.0, 1.0], None, false).unwrap();
        let hits = scan(&table, &[1.0, 0.0], 3, |_| true);
        assert_eq!(
            hits.iter().map(|h| h.0).collect::<Vec<_>>(),
            vec![2, 5, 9],
            "ties go to the smaller id"
        );
    }

    #[test]
    fn scan_honors_accept() {
        let mut table = VectorTable::new(1, Metric::Dot);
        for id in 0..10u32 {
            table.insert(id, &[id as f32], None, false).unwrap();
        }
        let hits = scan(&table, &[1.0], 3, |id| id % 2 == 0);
        assert!(hits.iter().all(|h| h.0 % 2 == 0));
        assert_eq!(hits[0].0, 8);
    }

    #[test]
    fn top_k_bounds_results() {
        let mut top = TopK::new(2);
        for (id, s) in [(1, 0.1), (2, 0.9), (3, 0.5), (4, 0.7)] {
            top.push(id, s);
        }
        assert_eq!(top.into_sorted(), vec![(2, 0.9), (4, 0.7)]);
    }
}
