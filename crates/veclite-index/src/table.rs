use bytes::Bytes;
use std::collections::HashMap;
use veclite_core::metric::{normalize_in_place, validate_vector};
use veclite_core::{Metric, Result, VecliteError, MAX_META_BYTES};

/// Outcome of an insert-or-replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upserted {
    Inserted,
    Replaced,
}

/// Dense in-memory vector table: three parallel columns (`ids`, row-major
/// `data`, `metas`) plus an id → slot map.
///
/// Slot space is compacted with swap-with-last on deletion, so
/// `pos[ids[i]] == i` holds for every live slot.
#[derive(Debug, Clone)]
pub struct VectorTable {
    dim: usize,
    metric: Metric,
    ids: Vec<u32>,
    data: Vec<f32>,
    metas: Vec<Option<Bytes>>,
    pos: HashMap<u32, u32>,
}

impl VectorTable {
    pub fn new(dim: usize, metric: Metric) -> Self {
        Self {
            dim,
            metric,
            ids: Vec::new(),
            data: Vec::new(),
            metas: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn has(&self, id: u32) -> bool {
        self.pos.contains_key(&id)
    }

    pub fn slot_of(&self, id: u32) -> Option<usize> {
        self.pos.get(&id).map(|s| *s as usize)
    }

    pub fn id_at(&self, slot: usize) -> u32 {
        self.ids[slot]
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    #[inline]
    pub fn vector_at(&self, slot: usize) -> &[f32] {
        &self.data[slot * self.dim..(slot + 1) * self.dim]
    }

    pub fn meta_at(&self, slot: usize) -> Option<&Bytes> {
        self.metas[slot].as_ref()
    }

    pub fn vector(&self, id: u32) -> Option<&[f32]> {
        self.slot_of(id).map(|s| self.vector_at(s))
    }

    pub fn meta(&self, id: u32) -> Option<Option<&Bytes>> {
        self.slot_of(id).map(|s| self.metas[s].as_ref())
    }

    fn check_meta(meta: Option<&Bytes>) -> Result<()> {
        if let Some(m) = meta {
            if m.len() > MAX_META_BYTES {
                return Err(VecliteError::InvalidVector(format!(
                    "meta blob of {} bytes exceeds the {MAX_META_BYTES}-byte cap",
                    m.len()
                )));
            }
        }
        Ok(())
    }

    /// Inserts or (with `upsert`) replaces a record. Cosine tables store
    /// the vector unit-normalized.
    pub fn insert(
        &mut self,
        id: u32,
        vector: &[f32],
        meta: Option<Bytes>,
        upsert: bool,
    ) -> Result<Upserted> {
        validate_vector(self.dim, vector)?;
        Self::check_meta(meta.as_ref())?;

        let mut row = vector.to_vec();
        if self.metric.normalizes() {
            normalize_in_place(&mut row);
        }

        if let Some(slot) = self.slot_of(id) {
            if !upsert {
                return Err(VecliteError::AlreadyExists(id));
            }
            self.data[slot * self.dim..(slot + 1) * self.dim].copy_from_slice(&row);
            self.metas[slot] = meta;
            return Ok(Upserted::Replaced);
        }

        let slot = self.ids.len();
        self.ids.push(id);
        self.data.extend_from_slice(&row);
        self.metas.push(meta);
        self.pos.insert(id, slot as u32);
        Ok(Upserted::Inserted)
    }

    /// Overwrites only the vector. With `upsert`, a missing id becomes a
    /// fresh record with no meta.
    pub fn set_vector(&mut self, id: u32, vector: &[f32], upsert: bool) -> Result<Upserted> {
        if self.has(id) {
            let meta = self.meta(id).and_then(|m| m.cloned());
            self.insert(id, vector, meta, true)
        } else if upsert {
            self.insert(id, vector, None, true)
        } else {
            Err(VecliteError::NotFound(format!("id {id}")))
        }
    }

    pub fn set_meta(&mut self, id: u32, meta: Option<Bytes>) -> Result<()> {
        Self::check_meta(meta.as_ref())?;
        let slot = self
            .slot_of(id)
            .ok_or_else(|| VecliteError::NotFound(format!("id {id}")))?;
        self.metas[slot] = meta;
        Ok(())
    }

    /// Swap-with-last removal. Returns false when the id was not present.
    pub fn remove(&mut self, id: u32) -> bool {
        let Some(slot) = self.slot_of(id) else {
            return false;
        };
        let last = self.ids.len() - 1;
        if slot != last {
            let moved_id = self.ids[last];
            self.ids.swap(slot, last);
            self.metas.swap(slot, last);
            for i in 0..self.dim {
                self.data.swap(slot * self.dim + i, last * self.dim + i);
            }
            self.pos.insert(moved_id, slot as u32);
        }
        self.ids.pop();
        self.metas.pop();
        self.data.truncate(last * self.dim);
        self.pos.remove(&id);
        true
    }

    /// Iterates `(id, vector, meta)` in slot order.
    pub fn rows(&self) -> impl Iterator<Item = (u32, &[f32], Option<&Bytes>)> {
        (0..self.len()).map(move |slot| (self.ids[slot], self.vector_at(slot), self.metas[slot].as_ref()))
    }

    /// Verifies I1 (`pos[ids[i]] == i`); exposed for tests and open-time
    /// integrity checks.
    pub fn check_compaction(&self) -> bool {
        self.pos.len() == self.ids.len()
            && self
                .ids
                .iter()
                .enumerate()
                .all(|(i, id)| self.pos.get(id) == Some(&(i as u32)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove_keeps_pos_consistent() {
        let mut t = VectorTable::new(2, Metric::Dot);
        for id in 0..10u32 {
            t.insert(id, &[id as f32, 0.0], None, false).unwrap();
        }
        assert!(t.remove(3));
        assert!(t.remove(0));
        assert!(!t.remove(99));
        assert_eq!(t.len(), 8);
        assert!(t.check_compaction());
        assert_eq!(t.vector(7).unwrap(), &[7.0, 0.0]);
    }

    #[test]
    fn cosine_rows_are_unit_length() {
        let mut t = VectorTable::new(2, Metric::Cosine);
        t.insert(1, &[3.0, 4.0], None, false).unwrap();
        let v = t.vector(1).unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[test]
    fn duplicate_insert_needs_upsert() {
        let mut t = VectorTable::new(1, Metric::Dot);
        t.insert(5, &[1.0], None, false).unwrap();
        assert!(matches!(
            t.insert(5, &[2.0], None, false),
            Err(VecliteError::AlreadyExists(5))
        ));
        assert_eq!(t.insert(5, &[2.0], None, true).unwrap(), Upserted::Replaced);
        assert_eq!(t.vector(5).unwrap(), &[2.0]);
    }

    #[test]
    fn set_vector_preserves_meta() {
        let mut t = VectorTable::new(1, Metric::Dot);
        t.insert(1, &[1.0], Some(Bytes::from_static(b"m")), false)
            .unwrap();
        t.set_vector(1, &[9.0], false).unwrap();
        assert_eq!(t.meta(1).unwrap().unwrap(), &Bytes::from_static(b"m"));
        assert!(t.set_vector(2, &[1.0], false).is_err());
        t.set_vector(2, &[1.0], true).unwrap();
        assert!(t.has(2));
    }

    #[test]
    fn rejects_bad_vectors() {
        let mut t = VectorTable::new(2, Metric::L2);
        assert!(t.insert(1, &[1.0], None, false).is_err());
        assert!(t.insert(1, &[1.0, f32::INFINITY], None, false).is_err());
    }
}
