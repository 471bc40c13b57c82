use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use veclite_core::config::AttrIndexStrategy;
use veclite_core::filter::RangeSpec;
use veclite_core::{AttrRecord, AttrValue};

/// Hashable key for the equality map. Equality is type-strict: `Int(5)`
/// and `Float(5.0)` index separately.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AttrKey {
    Str(String),
    Int(i64),
    Float(OrderedFloat<f64>),
    Bool(bool),
}

impl From<&AttrValue> for AttrKey {
    fn from(v: &AttrValue) -> Self {
        match v {
            AttrValue::Str(s) => AttrKey::Str(s.clone()),
            AttrValue::Int(i) => AttrKey::Int(*i),
            AttrValue::Float(f) => AttrKey::Float(OrderedFloat(*f)),
            AttrValue::Bool(b) => AttrKey::Bool(*b),
        }
    }
}

/// Per-key numeric run for range queries. Insertion only marks it dirty;
/// sorting is deferred to the first range query after a mutation.
#[derive(Debug, Default)]
struct NumRun {
    entries: Vec<(f64, u32)>,
    dirty: bool,
}

impl NumRun {
    fn push(&mut self, value: f64, id: u32) {
        self.entries.push((value, id));
        self.dirty = true;
    }

    fn retire(&mut self, id: u32) {
        self.entries.retain(|&(_, e)| e != id);
    }

    fn ensure_sorted(&mut self) {
        if self.dirty {
            self.entries
                .sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            self.dirty = false;
        }
    }
}

/// Inverted attribute index. Both strategies answer equality and
/// existence; only `basic` answers numeric ranges — `bitmap` returns
/// "no opinion" (`None`) and the caller falls back to a row-wise
/// predicate, so range semantics under `bitmap` follow the predicate,
/// not an indexed structure.
#[derive(Debug)]
pub struct AttributeIndex {
    strategy: AttrIndexStrategy,
    records: HashMap<u32, AttrRecord>,
    eq: HashMap<String, HashMap<AttrKey, RoaringBitmap>>,
    exists: HashMap<String, RoaringBitmap>,
    num: RwLock<HashMap<String, NumRun>>,
}

impl AttributeIndex {
    pub fn new(strategy: AttrIndexStrategy) -> Self {
        Self {
            strategy,
            records: HashMap::new(),
            eq: HashMap::new(),
            exists: HashMap::new(),
            num: RwLock::new(HashMap::new()),
        }
    }

    pub fn strategy(&self) -> AttrIndexStrategy {
        self.strategy
    }

    pub fn record(&self, id: u32) -> Option<&AttrRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Replaces the attribute record for `id`: old postings are removed,
    /// new ones inserted. `None` clears the record entirely.
    pub fn set_attrs(&mut self, id: u32, attrs: Option<AttrRecord>) {
        if let Some(old) = self.records.remove(&id) {
            self.unindex(id, &old);
        }
        if let Some(attrs) = attrs {
            self.index(id, &attrs);
            self.records.insert(id, attrs);
        }
    }

    pub fn remove(&mut self, id: u32) {
        self.set_attrs(id, None);
    }

    fn index(&mut self, id: u32, attrs: &AttrRecord) {
        for (key, payload) in attrs {
            self.exists.entry(key.clone()).or_default().insert(id);
            for value in payload.values() {
                self.eq
                    .entry(key.clone())
                    .or_default()
                    .entry(AttrKey::from(value))
                    .or_default()
                    .insert(id);
                if self.strategy == AttrIndexStrategy::Basic {
                    if let Some(n) = value.as_f64() {
                        self.num.write().entry(key.clone()).or_default().push(n, id);
                    }
                }
            }
        }
    }

    fn unindex(&mut self, id: u32, attrs: &AttrRecord) {
        for (key, payload) in attrs {
            if let Some(bm) = self.exists.get_mut(key) {
                bm.remove(id);
                if bm.is_empty() {
                    self.exists.remove(key);
                }
            }
            for value in payload.values() {
                if let Some(values) = self.eq.get_mut(key) {
                    let k = AttrKey::from(value);
                    if let Some(bm) = values.get_mut(&k) {
                        bm.remove(id);
                        if bm.is_empty() {
                            values.remove(&k);
                        }
                    }
                    if values.is_empty() {
                        self.eq.remove(key);
                    }
                }
            }
            if self.strategy == AttrIndexStrategy::Basic {
                let mut num = self.num.write();
                if let Some(run) = num.get_mut(key) {
                    run.retire(id);
                    if run.entries.is_empty() {
                        num.remove(key);
                    }
                }
            }
        }
    }

    /// Ids whose `key` equals `value`. The index always has an opinion on
    /// equality: an unknown key or value is the empty set.
    pub fn eq(&self, key: &str, value: &AttrValue) -> Option<RoaringBitmap> {
        Some(
            self.eq
                .get(key)
                .and_then(|values| values.get(&AttrKey::from(value)))
                .cloned()
                .unwrap_or_default(),
        )
    }

    /// Ids carrying `key` at all (including explicit nulls).
    pub fn exists(&self, key: &str) -> Option<RoaringBitmap> {
        Some(self.exists.get(key).cloned().unwrap_or_default())
    }

    /// Ids whose numeric `key` falls inside `range`. `None` means the
    /// strategy has no opinion and the caller must post-filter.
    pub fn range(&self, key: &str, range: &RangeSpec) -> Option<RoaringBitmap> {
        if self.strategy == AttrIndexStrategy::Bitmap {
            return None;
        }
        let mut num = self.num.write();
        let Some(run) = num.get_mut(key) else {
            return Some(RoaringBitmap::new());
        };
        run.ensure_sorted();

        // Lower bound via partition point, then walk forward until the
        // upper bound fails.
        let lower = range.gt.map_or(range.gte, Some).unwrap_or(f64::NEG_INFINITY);
        let start = run.entries.partition_point(|&(v, _)| v < lower);
        let mut out = RoaringBitmap::new();
        for &(v, id) in &run.entries[start..] {
            if let Some(b) = range.lt {
                if v >= b {
                    break;
                }
            }
            if let Some(b) = range.lte {
                if v > b {
                    break;
                }
            }
            if range.contains(v) {
                out.insert(id);
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclite_core::filter::AttrPayload;

    fn attrs(pairs: &[(&str, AttrValue)]) -> AttrRecord {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), AttrPayload::One(v.clone())))
            .collect()
    }

    #[test]
    fn eq_and_exists_track_replacement() {
        let mut idx = AttributeIndex::new(AttrIndexStrategy::Basic);
        idx.set_attrs(1, Some(attrs(&[("color", "red".into())])));
        idx.set_attrs(2, Some(attrs(&[("color", "blue".into())])));

        let red = idx.eq("color", &"red".into()).unwrap();
        assert!(red.contains(1) && !red.contains(2));

        idx.set_attrs(1, Some(attrs(&[("color", "blue".into())])));
        let red = idx.eq("color", &"red".into()).unwrap();
        assert!(red.is_empty());
        let blue = idx.eq("color", &"blue".into()).unwrap();
        assert_eq!(blue.len(), 2);

        idx.set_attrs(2, None);
        assert!(!idx.exists("color").unwrap().contains(2));
    }

    #[test]
    fn arrays_index_every_element() {
        let mut idx = AttributeIndex::new(AttrIndexStrategy::Basic);
        let mut rec = AttrRecord::new();
        rec.insert(
            "tags".into(),
            AttrPayload::Many(vec!["a".into(), "b".into()]),
        );
        idx.set_attrs(9, Some(rec));
        assert!(idx.eq("tags", &"a".into()).unwrap().contains(9));
        assert!(idx.eq("tags", &"b".into()).unwrap().contains(9));
    }

    #[test]
    fn basic_range_with_mixed_bounds() {
        let mut idx = AttributeIndex::new(AttrIndexStrategy::Basic);
        for (id, price) in [(1, 10.0), (2, 20.0), (3, 15.0)] {
            idx.set_attrs(id, Some(attrs(&[("price", price.into())])));
        }
        let r = idx
            .range(
                "price",
                &RangeSpec {
                    gte: Some(10.0),
                    lt: Some(20.0),
                    ..RangeSpec::default()
                },
            )
            .unwrap();
        assert!(r.contains(1) && r.contains(3) && !r.contains(2));
    }

    #[test]
    fn bitmap_declines_range() {
        let mut idx = AttributeIndex::new(AttrIndexStrategy::Bitmap);
        idx.set_attrs(1, Some(attrs(&[("price", 10.into())])));
        assert!(idx.range("price", &RangeSpec::default()).is_none());
        // Equality still answered.
        assert!(idx.eq("price", &10.into()).unwrap().contains(1));
    }

    #[test]
    fn int_and_float_both_hit_numeric_range() {
        let mut idx = AttributeIndex::new(AttrIndexStrategy::Basic);
        idx.set_attrs(1, Some(attrs(&[("n", AttrValue::Int(5))])));
        idx.set_attrs(2, Some(attrs(&[("n", AttrValue::Float(5.5))])));
        let r = idx
            .range(
                "n",
                &RangeSpec {
                    gt: Some(4.0),
                    lte: Some(5.5),
                    ..RangeSpec::default()
                },
            )
            .unwrap();
        assert_eq!(r.len(), 2);
    }
}
