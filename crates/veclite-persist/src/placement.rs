use serde::{Deserialize, Serialize};

/// One placement destination, resolved to a blob store by key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub key: String,
}

/// Deterministic CRUSH-style segment placement: a segment name hashes to
/// a placement group, and targets are ranked per group by a keyed hash.
/// Adding a target moves roughly `1/|targets|` of the segments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementMap {
    pub pgs: u32,
    pub replicas: u32,
    pub targets: Vec<Target>,
}

impl PlacementMap {
    pub fn new(pgs: u32, replicas: u32, target_keys: impl IntoIterator<Item = String>) -> Self {
        Self {
            pgs: pgs.max(1),
            replicas: replicas.max(1),
            targets: target_keys
                .into_iter()
                .map(|key| Target { key })
                .collect(),
        }
    }

    /// Single-target map: everything lands on `key`.
    pub fn single(key: impl Into<String>) -> Self {
        Self::new(1, 1, [key.into()])
    }

    pub fn pg_of(&self, segment_name: &str) -> u64 {
        hash64(segment_name.as_bytes()) % u64::from(self.pgs)
    }

    /// Target keys for a segment: primary first, then copies.
    pub fn assign(&self, segment_name: &str) -> Vec<&str> {
        let pg = self.pg_of(segment_name);
        let mut ranked: Vec<(u64, &str)> = self
            .targets
            .iter()
            .map(|t| {
                let mut buf = Vec::with_capacity(8 + t.key.len());
                buf.extend_from_slice(&pg.to_le_bytes());
                buf.extend_from_slice(t.key.as_bytes());
                (hash64(&buf), t.key.as_str())
            })
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(b.1)));
        ranked
            .into_iter()
            .take(self.replicas as usize)
            .map(|(_, key)| key)
            .collect()
    }

    pub fn primary(&self, segment_name: &str) -> Option<&str> {
        self.assign(segment_name).first().copied()
    }
}

fn hash64(bytes: &[u8]) -> u64 {
    let hash = blake3::hash(bytes);
    u64::from_le_bytes(hash.as_bytes()[..8].try_into().expect("hash is 32 bytes"))
}
