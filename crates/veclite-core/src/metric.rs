use crate::error::{Result, VecliteError};
use serde::{Deserialize, Serialize};

/// Distance metric. All three are expressed as a *score* where larger means
/// closer, so strategy code ranks uniformly:
/// cosine = dot product over unit vectors, l2 = negated euclidean distance,
/// dot = raw dot product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Cosine,
    L2,
    Dot,
}

impl Metric {
    #[inline]
    pub fn score(self, q: &[f32], v: &[f32]) -> f32 {
        match self {
            Metric::Cosine | Metric::Dot => dot(q, v),
            Metric::L2 => -l2_distance(q, v),
        }
    }

    /// Whether vectors are unit-normalized when written to the table.
    pub fn normalizes(self) -> bool {
        matches!(self, Metric::Cosine)
    }
}

#[inline]
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

#[inline]
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Scales `v` to unit length in place. Zero vectors are left untouched.
/// Division (not inverse multiplication) keeps axis-aligned vectors
/// exactly unit.
pub fn normalize_in_place(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > f32::EPSILON && (norm - 1.0).abs() > 1e-9 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
}

/// Rejects wrong-length and non-finite vectors before they reach a table.
pub fn validate_vector(dim: usize, v: &[f32]) -> Result<()> {
    if v.len() != dim {
        return Err(VecliteError::DimensionMismatch {
            expected: dim,
            got: v.len(),
        });
    }
    if let Some(i) = v.iter().position(|x| !x.is_finite()) {
        return Err(VecliteError::InvalidVector(format!(
            "non-finite component at index {i}"
        )));
    }
    Ok(())
}

/// Ranking order for search hits: descending score, ties broken by the
/// smaller id.
#[inline]
pub fn hit_order(a: (u32, f32), b: (u32, f32)) -> std::cmp::Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(std::cmp::Ordering::Equal)
        .then_with(|| a.0.cmp(&b.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_scores_unit_vectors() {
        let q = [1.0, 0.0];
        assert!((Metric::Cosine.score(&q, &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(Metric::Cosine.score(&q, &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn l2_score_is_negated_distance() {
        let s = Metric::L2.score(&[0.0, 0.0], &[3.0, 4.0]);
        assert!((s + 5.0).abs() < 1e-6);
    }

    #[test]
    fn normalize_rejects_nothing_but_scales() {
        let mut v = vec![3.0, 4.0];
        normalize_in_place(&mut v);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn validate_catches_nan_and_dim() {
        assert!(validate_vector(2, &[1.0, f32::NAN]).is_err());
        assert!(validate_vector(3, &[1.0, 2.0]).is_err());
        assert!(validate_vector(2, &[1.0, 2.0]).is_ok());
    }

    #[test]
    fn hit_order_prefers_high_score_then_small_id() {
        let mut hits = vec![(3, 0.5), (1, 0.9), (2, 0.9)];
        hits.sort_by(|a, b| hit_order(*a, *b));
        assert_eq!(hits, vec![(1, 0.9), (2, 0.9), (3, 0.5)]);
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_vec() -> impl Strategy<Value = Vec<f32>> {
        proptest::collection::vec(-50.0f32..50.0, 4)
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn normalize_is_idempotent(mut v in arb_vec()) {
            prop_assume!(l2_norm(&v) > 1e-3);
            normalize_in_place(&mut v);
            let once = v.clone();
            normalize_in_place(&mut v);
            for (a, b) in once.iter().zip(v.iter()) {
                prop_assert!((a - b).abs() < 1e-6);
            }
        }

        #[test]
        fn scores_are_symmetric(a in arb_vec(), b in arb_vec()) {
            prop_assert_eq!(dot(&a, &b), dot(&b, &a));
            prop_assert!((l2_distance(&a, &b) - l2_distance(&b, &a)).abs() < 1e-6);
        }
    }
}
