use crate::placement::PlacementMap;
use serde::{Deserialize, Serialize};
use veclite_core::{DatabaseConfig, Result, VecliteError};

pub const MANIFEST_VERSION: u32 = 1;
pub const CATALOG_VERSION: u32 = 1;

/// One committed segment: where it lives and how to verify it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentEntry {
    pub name: String,
    pub target_key: String,
    pub rows: u32,
    pub bytes: u64,
    pub checksum: u64,
}

/// Snapshot composition: the segment list for one committed epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub epoch: u64,
    pub commit_ts: u64,
    pub dim: u32,
    pub metric: veclite_core::Metric,
    pub strategy: veclite_core::Strategy,
    pub segments: Vec<SegmentEntry>,
    pub placement: PlacementMap,
    /// Pairs the `.index` payload with this snapshot; absent when the
    /// save carried no ANN artifact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ann_fingerprint: Option<u64>,
}

/// Collection descriptor; everything `open` needs to allocate the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Catalog {
    pub version: u32,
    pub name: String,
    pub database: DatabaseConfig,
    pub count: u64,
    pub segmented: bool,
}

/// Committed pointer, written last. Carries its manifest so a HEAD read
/// alone pins a consistent snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Head {
    pub manifest: Manifest,
    pub epoch: u64,
    pub commit_ts: u64,
}

pub fn manifest_key(name: &str) -> String {
    format!("{name}.manifest.json")
}

pub fn catalog_key(name: &str) -> String {
    format!("{name}.catalog.json")
}

pub fn head_key(name: &str) -> String {
    format!("{name}.head.json")
}

pub fn index_key(name: &str) -> String {
    format!("{name}.index")
}

pub fn wal_key(name: &str) -> String {
    format!("{name}.wal")
}

/// `{name}-e{epoch}-s{idx}.data`; unique per epoch so segments stay
/// immutable and stale ones are recognizable for GC.
pub fn segment_name(name: &str, epoch: u64, idx: usize) -> String {
    format!("{name}-e{epoch}-s{idx:04}.data")
}

/// Prefix shared by every segment of a collection.
pub fn segment_prefix(name: &str) -> String {
    format!("{name}-e")
}

pub fn to_json_bytes<T: Serialize>(value: &T) -> Result<bytes::Bytes> {
    let buf = serde_json::to_vec_pretty(value)
        .map_err(|e| VecliteError::Io(std::io::Error::other(e)))?;
    Ok(bytes::Bytes::from(buf))
}

pub fn from_json_bytes<T: for<'de> Deserialize<'de>>(key: &str, buf: &[u8]) -> Result<T> {
    serde_json::from_slice(buf)
        .map_err(|e| VecliteError::corrupt(0, format!("{key}: invalid JSON artifact: {e}")))
}
