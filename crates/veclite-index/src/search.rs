use crate::filter_eval::{compile, matches_row, Candidates};
use crate::hnsw::TraversalOpts;
use crate::{Ann, VectorStore};
use bytes::Bytes;
use veclite_core::config::{FilterMode, FilterSearchConfig, SeedCount, SeedStrategy};
use veclite_core::metric::{normalize_in_place, validate_vector};
use veclite_core::{FilterExpr, Result};

/// One search call: `k` plus the optional filter and traversal knobs.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub k: usize,
    pub filter: Option<FilterExpr>,
    pub mode: FilterMode,
    pub bridge_budget: usize,
    pub seeds: SeedCount,
    pub seed_strategy: SeedStrategy,
    pub adaptive_ef: bool,
    pub early_stop_margin: Option<f32>,
    /// Overrides the configured `ef_search` for this call.
    pub ef_search: Option<usize>,
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self::with_defaults(k, &FilterSearchConfig::default())
    }

    pub fn with_defaults(k: usize, defaults: &FilterSearchConfig) -> Self {
        Self {
            k,
            filter: None,
            mode: defaults.mode,
            bridge_budget: defaults.bridge_budget,
            seeds: defaults.seeds,
            seed_strategy: defaults.seed_strategy,
            adaptive_ef: defaults.adaptive_ef,
            early_stop_margin: defaults.early_stop_margin,
            ef_search: None,
        }
    }

    pub fn filter(mut self, filter: FilterExpr) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn mode(mut self, mode: FilterMode) -> Self {
        self.mode = mode;
        self
    }
}

/// One search result, best first.
#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub id: u32,
    pub score: f32,
    pub meta: Option<Bytes>,
}

/// Strategy dispatch with filter preselection.
pub fn search(store: &VectorStore, query: &[f32], opts: &SearchOptions) -> Result<Vec<Hit>> {
    let table = &store.table;
    validate_vector(table.dim(), query)?;
    let mut q = query.to_vec();
    if table.metric().normalizes() {
        normalize_in_place(&mut q);
    }

    let compiled = opts
        .filter
        .as_ref()
        .map(|expr| compile(expr, &store.attrs, table));

    // An exactly-empty candidate set cannot be widened by post-filtering.
    if compiled
        .as_ref()
        .is_some_and(crate::filter_eval::CompiledFilter::is_empty)
    {
        return Ok(Vec::new());
    }

    let unrestricted = Candidates::All;
    let (pre, exact) = match &compiled {
        Some(c) => (&c.pre, c.exact),
        None => (&unrestricted, true),
    };

    // Post-filter only when a clause escaped the index.
    let post_expr = if exact { None } else { opts.filter.as_ref() };
    let accept = |id: u32| -> bool {
        if !pre.contains(id) {
            return false;
        }
        let Some(expr) = post_expr else {
            return true;
        };
        let attrs = store.attrs.record(id);
        let meta_json = store
            .table
            .meta(id)
            .flatten()
            .and_then(|m| serde_json::from_slice::<serde_json::Value>(m).ok());
        matches_row(expr, id, attrs, meta_json.as_ref())
    };

    let raw = match &store.ann {
        Ann::Bruteforce => crate::bruteforce::scan(table, &q, opts.k, accept),
        Ann::Ivf(ivf) => ivf.search(table, &q, opts.k, ivf.params().nprobe, accept),
        Ann::Hnsw(hnsw) => {
            let ef = opts.ef_search.unwrap_or(hnsw.params().ef_search).max(opts.k);
            if compiled.is_none() {
                hnsw.search(table, &q, opts.k, ef)
            } else {
                let traversal = TraversalOpts {
                    mode: opts.mode,
                    bridge_budget: opts.bridge_budget,
                    seeds: opts.seeds,
                    seed_strategy: opts.seed_strategy,
                    adaptive_ef: opts.adaptive_ef,
                    early_stop_margin: opts.early_stop_margin,
                };
                hnsw.search_filtered(table, &q, opts.k, ef, pre.finite(), &accept, &traversal)
            }
        }
    };

    Ok(raw
        .into_iter()
        .map(|(id, score)| Hit {
            id,
            score,
            meta: table.meta(id).flatten().cloned(),
        })
        .collect())
}
