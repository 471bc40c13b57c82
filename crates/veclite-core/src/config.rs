use crate::metric::Metric;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// ANN strategy selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    #[default]
    Bruteforce,
    Hnsw,
    Ivf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswParams {
    #[serde(default = "default_m")]
    pub m: usize,
    #[serde(default = "default_ef_construction")]
    pub ef_construction: usize,
    #[serde(default = "default_ef_search")]
    pub ef_search: usize,
    #[serde(default)]
    pub seed: u64,
}

fn default_m() -> usize {
    16
}
fn default_ef_construction() -> usize {
    200
}
fn default_ef_search() -> usize {
    64
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: default_m(),
            ef_construction: default_ef_construction(),
            ef_search: default_ef_search(),
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfParams {
    #[serde(default = "default_nlist")]
    pub nlist: usize,
    #[serde(default = "default_nprobe")]
    pub nprobe: usize,
}

fn default_nlist() -> usize {
    64
}
fn default_nprobe() -> usize {
    8
}

impl Default for IvfParams {
    fn default() -> Self {
        Self {
            nlist: default_nlist(),
            nprobe: default_nprobe(),
        }
    }
}

/// Attribute-index flavor. `bitmap` trades numeric-range support for
/// smaller inverted structures; range queries under it fall back to
/// row-wise predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrIndexStrategy {
    #[default]
    Basic,
    Bitmap,
}

/// Shape of one logical vector collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub dim: usize,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub hnsw: HnswParams,
    #[serde(default)]
    pub ivf: IvfParams,
    #[serde(default)]
    pub attrs: AttrIndexStrategy,
}

impl DatabaseConfig {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            metric: Metric::default(),
            strategy: Strategy::default(),
            hnsw: HnswParams::default(),
            ivf: IvfParams::default(),
            attrs: AttrIndexStrategy::default(),
        }
    }
}

/// Durable-layout knobs for one named index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    #[serde(default = "default_index_name")]
    pub name: String,
    #[serde(default = "default_one")]
    pub shards: u32,
    #[serde(default = "default_one")]
    pub replicas: u32,
    #[serde(default = "default_pgs")]
    pub pgs: u32,
    #[serde(default = "default_true")]
    pub segmented: bool,
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: usize,
    #[serde(default = "default_true")]
    pub include_ann: bool,
}

fn default_index_name() -> String {
    "default".to_string()
}
fn default_one() -> u32 {
    1
}
fn default_pgs() -> u32 {
    64
}
fn default_true() -> bool {
    true
}
fn default_segment_bytes() -> usize {
    4 * 1024 * 1024
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            name: default_index_name(),
            shards: 1,
            replicas: 1,
            pgs: default_pgs(),
            segmented: true,
            segment_bytes: default_segment_bytes(),
            include_ann: true,
        }
    }
}

/// Where blobs live. `data` either names a single store or maps placement
/// target keys to stores; hosts can register extra URI schemes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_mem_uri")]
    pub index: String,
    #[serde(default)]
    pub data: DataStorageConfig,
}

fn default_mem_uri() -> String {
    "mem:".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            index: default_mem_uri(),
            data: DataStorageConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DataStorageConfig {
    /// One store for every placement target.
    Uri(String),
    /// Explicit target-key to store mapping.
    Map(HashMap<String, String>),
}

impl Default for DataStorageConfig {
    fn default() -> Self {
        DataStorageConfig::Uri(default_mem_uri())
    }
}

/// Commit/consistency knobs for the save/open path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub result_consistency: bool,
    #[serde(default = "default_epsilon_ms")]
    pub epsilon_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_name: Option<String>,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
}

fn default_epsilon_ms() -> u64 {
    500
}
fn default_lock_ttl_ms() -> u64 {
    10_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            result_consistency: false,
            epsilon_ms: default_epsilon_ms(),
            lock_name: None,
            lock_ttl_ms: default_lock_ttl_ms(),
        }
    }
}

/// Auto-save thresholds: a save runs when either trips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutoSaveConfig {
    #[serde(default = "default_ops_threshold")]
    pub ops_threshold: u64,
    #[serde(default = "default_autosave_interval_ms")]
    pub interval_ms: u64,
}

fn default_ops_threshold() -> u64 {
    512
}
fn default_autosave_interval_ms() -> u64 {
    30_000
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            ops_threshold: default_ops_threshold(),
            interval_ms: default_autosave_interval_ms(),
        }
    }
}

/// Defaults for filtered search; each call may override them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterSearchConfig {
    #[serde(default)]
    pub mode: FilterMode,
    #[serde(default = "default_bridge_budget")]
    pub bridge_budget: usize,
    #[serde(default)]
    pub seeds: SeedCount,
    #[serde(default)]
    pub seed_strategy: SeedStrategy,
    #[serde(default = "default_true")]
    pub adaptive_ef: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub early_stop_margin: Option<f32>,
}

fn default_bridge_budget() -> usize {
    128
}

impl Default for FilterSearchConfig {
    fn default() -> Self {
        Self {
            mode: FilterMode::default(),
            bridge_budget: default_bridge_budget(),
            seeds: SeedCount::default(),
            seed_strategy: SeedStrategy::default(),
            adaptive_ef: true,
            early_stop_margin: None,
        }
    }
}

/// Soft traversal may bridge through non-candidate nodes (budgeted); hard
/// traversal never leaves the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterMode {
    #[default]
    Soft,
    Hard,
}

/// `"auto"` or an explicit seed count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SeedCount {
    #[default]
    Auto,
    Fixed(usize),
}

impl Serialize for SeedCount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            SeedCount::Auto => serializer.serialize_str("auto"),
            SeedCount::Fixed(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for SeedCount {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(usize),
            Text(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Ok(SeedCount::Fixed(n)),
            Repr::Text(s) if s == "auto" => Ok(SeedCount::Auto),
            Repr::Text(s) => Err(serde::de::Error::custom(format!(
                "expected \"auto\" or a number, got {s:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeedStrategy {
    #[default]
    Random,
    Nearest,
}

/// Fully resolved library configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub filter_search: FilterSearchConfig,
    /// `None` disables auto-save; explicit saves still work.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autosave: Option<AutoSaveConfig>,
}

impl Config {
    pub fn new(dim: usize) -> Self {
        Self {
            database: DatabaseConfig::new(dim),
            index: IndexConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
            filter_search: FilterSearchConfig::default(),
            autosave: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_from_json() {
        let cfg: Config = serde_json::from_str(r#"{"database": {"dim": 8}}"#).unwrap();
        assert_eq!(cfg.database.dim, 8);
        assert_eq!(cfg.database.metric, Metric::Cosine);
        assert_eq!(cfg.database.strategy, Strategy::Bruteforce);
        assert_eq!(cfg.database.hnsw.m, 16);
        assert_eq!(cfg.index.pgs, 64);
        assert!(cfg.index.include_ann);
    }

    #[test]
    fn seed_count_accepts_auto_or_number() {
        let s: SeedCount = serde_json::from_str("\"auto\"").unwrap();
        assert_eq!(s, SeedCount::Auto);
        let s: SeedCount = serde_json::from_str("12").unwrap();
        assert_eq!(s, SeedCount::Fixed(12));
    }

    #[test]
    fn strategy_names_are_lowercase() {
        let s: Strategy = serde_json::from_str("\"hnsw\"").unwrap();
        assert_eq!(s, Strategy::Hnsw);
        let s: Strategy = serde_json::from_str("\"bruteforce\"").unwrap();
        assert_eq!(s, Strategy::Bruteforce);
    }
}
