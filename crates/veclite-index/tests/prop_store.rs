use proptest::prelude::*;
use veclite_core::{DatabaseConfig, Metric};
use veclite_index::{SearchOptions, VectorStore};

const D: usize = 4;

fn arb_vector() -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec(-100.0f32..100.0, D)
}

#[derive(Debug, Clone)]
enum Op {
    Add(u32, Vec<f32>),
    Remove(u32),
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            (0u32..64, arb_vector()).prop_map(|(id, v)| Op::Add(id, v)),
            (0u32..64).prop_map(Op::Remove),
        ],
        1..80,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    #[test]
    fn compaction_invariant_after_any_op_sequence(ops in arb_ops()) {
        let mut cfg = DatabaseConfig::new(D);
        cfg.metric = Metric::L2;
        let mut store = VectorStore::new(cfg).unwrap();
        for op in ops {
            match op {
                Op::Add(id, v) => {
                    store.add(id, &v, None, true).unwrap();
                }
                Op::Remove(id) => {
                    store.remove(id);
                }
            }
            prop_assert!(store.table().check_compaction());
        }
    }

    #[test]
    fn cosine_unit_invariant(vectors in proptest::collection::vec(arb_vector(), 1..30)) {
        let mut store = VectorStore::new(DatabaseConfig::new(D)).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            if v.iter().map(|x| x * x).sum::<f32>() <= f32::EPSILON {
                continue; // zero vectors stay zero
            }
            store.add(i as u32, v, None, true).unwrap();
        }
        for slot in 0..store.table().len() {
            let row = store.table().vector_at(slot);
            let norm: f32 = row.iter().map(|x| x * x).sum::<f32>().sqrt();
            prop_assert!((norm - 1.0).abs() < 1e-5, "slot {} has norm {}", slot, norm);
        }
    }

    #[test]
    fn bruteforce_search_is_sorted_and_bounded(
        vectors in proptest::collection::vec(arb_vector(), 1..40),
        query in arb_vector(),
        k in 1usize..10,
    ) {
        let mut cfg = DatabaseConfig::new(D);
        cfg.metric = Metric::L2;
        let mut store = VectorStore::new(cfg).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            store.add(i as u32, v, None, true).unwrap();
        }
        let hits = store.search(&query, &SearchOptions::new(k)).unwrap();
        prop_assert!(hits.len() <= k);
        for pair in hits.windows(2) {
            prop_assert!(
                pair[0].score > pair[1].score
                    || (pair[0].score == pair[1].score && pair[0].id < pair[1].id)
            );
        }
    }
}
