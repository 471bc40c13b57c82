use crate::attrs::AttributeIndex;
use crate::table::VectorTable;
use roaring::RoaringBitmap;
use std::collections::HashMap;
use veclite_core::filter::{FilterScope, RangeSpec};
use veclite_core::{AttrRecord, AttrValue, FilterExpr};

/// Preselection result: either no restriction or a finite id set.
#[derive(Debug, Clone)]
pub enum Candidates {
    All,
    Set(RoaringBitmap),
}

impl Candidates {
    pub fn contains(&self, id: u32) -> bool {
        match self {
            Candidates::All => true,
            Candidates::Set(bm) => bm.contains(id),
        }
    }

    pub fn finite(&self) -> Option<&RoaringBitmap> {
        match self {
            Candidates::All => None,
            Candidates::Set(bm) => Some(bm),
        }
    }

    pub fn is_empty_set(&self) -> bool {
        matches!(self, Candidates::Set(bm) if bm.is_empty())
    }

    fn intersect(self, other: Candidates) -> Candidates {
        match (self, other) {
            (Candidates::All, c) | (c, Candidates::All) => c,
            (Candidates::Set(a), Candidates::Set(b)) => Candidates::Set(a & b),
        }
    }
}

/// A compiled filter: `pre` is a conservative superset of the matching
/// ids; when `exact` is false the original expression must be re-checked
/// row-wise (the post-filter path).
#[derive(Debug)]
pub struct CompiledFilter {
    pub pre: Candidates,
    pub exact: bool,
}

impl CompiledFilter {
    /// True when no id can possibly match.
    pub fn is_empty(&self) -> bool {
        self.pre.is_empty_set()
    }
}

fn universe(table: &VectorTable) -> RoaringBitmap {
    table.ids().iter().copied().collect()
}

/// Compiles `expr` into a candidate set by set algebra over the index's
/// preselection primitives. Clauses the index cannot answer (meta scope,
/// range under the bitmap strategy) widen the set and flip `exact` off.
pub fn compile(expr: &FilterExpr, attrs: &AttributeIndex, table: &VectorTable) -> CompiledFilter {
    match expr {
        FilterExpr::Match { key, value, scope } => match scope {
            FilterScope::Attr => exact_or_all(attrs.eq(key, value)),
            FilterScope::Meta => inexact(),
        },
        FilterExpr::Exists { key, scope } => match scope {
            FilterScope::Attr => exact_or_all(attrs.exists(key)),
            FilterScope::Meta => inexact(),
        },
        FilterExpr::Range { key, range, scope } => match scope {
            FilterScope::Attr => exact_or_all(attrs.range(key, range)),
            FilterScope::Meta => inexact(),
        },
        FilterExpr::HasId { values } => CompiledFilter {
            pre: Candidates::Set(values.iter().copied().collect()),
            exact: true,
        },
        FilterExpr::All(clauses) => {
            let mut pre = Candidates::All;
            let mut exact = true;
            for clause in clauses {
                let c = compile(clause, attrs, table);
                exact &= c.exact;
                pre = pre.intersect(c.pre);
                if pre.is_empty_set() && exact {
                    break; // Short circuit
                }
            }
            CompiledFilter { pre, exact }
        }
        FilterExpr::Any { clauses, min } => {
            let min = (*min).max(1);
            let compiled: Vec<CompiledFilter> = clauses
                .iter()
                .map(|c| compile(c, attrs, table))
                .collect();
            let opinionless = compiled
                .iter()
                .filter(|c| matches!(c.pre, Candidates::All))
                .count();
            if opinionless >= min {
                // Enough unanswerable clauses that any id might qualify.
                return CompiledFilter {
                    pre: Candidates::All,
                    exact: false,
                };
            }
            // Support count over the answered clauses; ids need at least
            // `min - opinionless` of them.
            let needed = min - opinionless;
            let mut support: HashMap<u32, usize> = HashMap::new();
            for c in &compiled {
                if let Candidates::Set(bm) = &c.pre {
                    for id in bm {
                        *support.entry(id).or_default() += 1;
                    }
                }
            }
            let set: RoaringBitmap = support
                .into_iter()
                .filter(|&(_, n)| n >= needed)
                .map(|(id, _)| id)
                .collect();
            CompiledFilter {
                pre: Candidates::Set(set),
                exact: opinionless == 0 && compiled.iter().all(|c| c.exact),
            }
        }
        FilterExpr::Not(inner) => {
            let c = compile(inner, attrs, table);
            if c.exact {
                match c.pre {
                    Candidates::Set(bm) => CompiledFilter {
                        pre: Candidates::Set(universe(table) - bm),
                        exact: true,
                    },
                    Candidates::All => CompiledFilter {
                        pre: Candidates::Set(RoaringBitmap::new()),
                        exact: true,
                    },
                }
            } else {
                inexact()
            }
        }
    }
}

fn exact_or_all(answer: Option<RoaringBitmap>) -> CompiledFilter {
    match answer {
        Some(bm) => CompiledFilter {
            pre: Candidates::Set(bm),
            exact: true,
        },
        None => inexact(),
    }
}

fn inexact() -> CompiledFilter {
    CompiledFilter {
        pre: Candidates::All,
        exact: false,
    }
}

/// Row-wise evaluation of the full expression; the post-filter for
/// clauses the index could not answer.
pub fn matches_row(
    expr: &FilterExpr,
    id: u32,
    attrs: Option<&AttrRecord>,
    meta: Option<&serde_json::Value>,
) -> bool {
    match expr {
        FilterExpr::Match { key, value, scope } => match scope {
            FilterScope::Attr => attrs
                .and_then(|r| r.get(key))
                .is_some_and(|payload| payload.values().any(|v| v == value)),
            FilterScope::Meta => meta_field(meta, key).is_some_and(|v| json_matches(v, value)),
        },
        FilterExpr::Exists { key, scope } => match scope {
            FilterScope::Attr => attrs.is_some_and(|r| r.contains_key(key)),
            FilterScope::Meta => meta_field(meta, key).is_some(),
        },
        FilterExpr::Range { key, range, scope } => match scope {
            FilterScope::Attr => attrs.and_then(|r| r.get(key)).is_some_and(|payload| {
                payload
                    .values()
                    .filter_map(AttrValue::as_f64)
                    .any(|n| range.contains(n))
            }),
            FilterScope::Meta => {
                meta_field(meta, key).is_some_and(|v| json_in_range(v, range))
            }
        },
        FilterExpr::HasId { values } => values.contains(&id),
        FilterExpr::All(clauses) => clauses.iter().all(|c| matches_row(c, id, attrs, meta)),
        FilterExpr::Any { clauses, min } => {
            let min = (*min).max(1);
            clauses
                .iter()
                .filter(|c| matches_row(c, id, attrs, meta))
                .count()
                >= min
        }
        FilterExpr::Not(inner) => !matches_row(inner, id, attrs, meta),
    }
}

fn meta_field<'a>(
    meta: Option<&'a serde_json::Value>,
    key: &str,
) -> Option<&'a serde_json::Value> {
    meta.and_then(|v| v.as_object()).and_then(|obj| obj.get(key))
}

fn json_matches(v: &serde_json::Value, expected: &AttrValue) -> bool {
    use serde_json::Value;
    match (v, expected) {
        (Value::Array(items), _) => items.iter().any(|item| json_matches(item, expected)),
        (Value::String(s), AttrValue::Str(e)) => s == e,
        (Value::Bool(b), AttrValue::Bool(e)) => b == e,
        (Value::Number(n), AttrValue::Int(e)) => n.as_i64() == Some(*e),
        (Value::Number(n), AttrValue::Float(e)) => n.as_f64() == Some(*e),
        _ => false,
    }
}

fn json_in_range(v: &serde_json::Value, range: &RangeSpec) -> bool {
    use serde_json::Value;
    match v {
        Value::Array(items) => items.iter().any(|item| json_in_range(item, range)),
        Value::Number(n) => n.as_f64().is_some_and(|x| range.contains(x)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veclite_core::config::AttrIndexStrategy;
    use veclite_core::filter::AttrPayload;
    use veclite_core::Metric;

    fn setup() -> (AttributeIndex, VectorTable) {
        let mut table = VectorTable::new(1, Metric::Dot);
        let mut attrs = AttributeIndex::new(AttrIndexStrategy::Basic);
        for (id, color, price) in [(1, "red", 10.0), (2, "blue", 20.0), (3, "red", 15.0)] {
            table.insert(id, &[id as f32], None, false).unwrap();
            let mut rec = AttrRecord::new();
            rec.insert("color".into(), AttrPayload::One(color.into()));
            rec.insert("price".into(), AttrPayload::One(price.into()));
            attrs.set_attrs(id, Some(rec));
        }
        (attrs, table)
    }

    #[test]
    fn all_intersects_eq_and_range() {
        let (attrs, table) = setup();
        let expr = FilterExpr::All(vec![
            FilterExpr::eq("color", "red"),
            FilterExpr::range(
                "price",
                RangeSpec {
                    gte: Some(10.0),
                    lt: Some(20.0),
                    ..RangeSpec::default()
                },
            ),
        ]);
        let c = compile(&expr, &attrs, &table);
        assert!(c.exact);
        let bm = c.pre.finite().unwrap();
        assert!(bm.contains(1) && bm.contains(3) && !bm.contains(2));
    }

    #[test]
    fn not_complements_against_universe() {
        let (attrs, table) = setup();
        let expr = FilterExpr::Not(Box::new(FilterExpr::eq("color", "red")));
        let c = compile(&expr, &attrs, &table);
        assert!(c.exact);
        let bm = c.pre.finite().unwrap();
        assert_eq!(bm.iter().collect::<Vec<_>>(), vec![2]);
    }

    #[test]
    fn any_with_min_counts_support() {
        let (attrs, table) = setup();
        let expr = FilterExpr::Any {
            clauses: vec![
                FilterExpr::eq("color", "red"),
                FilterExpr::range(
                    "price",
                    RangeSpec {
                        gte: Some(15.0),
                        ..RangeSpec::default()
                    },
                ),
            ],
            min: 2,
        };
        let c = compile(&expr, &attrs, &table);
        assert!(c.exact);
        // Only id 3 is both red and >= 15.
        assert_eq!(c.pre.finite().unwrap().iter().collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn meta_scope_is_inexact_and_post_filtered() {
        let (attrs, table) = setup();
        let expr = FilterExpr::Match {
            key: "tag".into(),
            value: "x".into(),
            scope: FilterScope::Meta,
        };
        let c = compile(&expr, &attrs, &table);
        assert!(!c.exact);
        assert!(matches!(c.pre, Candidates::All));

        let meta: serde_json::Value = serde_json::json!({"tag": "x"});
        assert!(matches_row(&expr, 1, None, Some(&meta)));
        let other: serde_json::Value = serde_json::json!({"tag": "y"});
        assert!(!matches_row(&expr, 1, None, Some(&other)));
        assert!(!matches_row(&expr, 1, None, None));
    }

    #[test]
    fn boolean_identities_hold() {
        let (attrs, table) = setup();
        let red = FilterExpr::eq("color", "red");
        // Not(Not(e)) == e
        let double_not = FilterExpr::Not(Box::new(FilterExpr::Not(Box::new(red.clone()))));
        let a = compile(&red, &attrs, &table);
        let b = compile(&double_not, &attrs, &table);
        assert_eq!(a.pre.finite(), b.pre.finite());
        // All(e) == Any(e, 1)
        let all_one = compile(&FilterExpr::All(vec![red.clone()]), &attrs, &table);
        let any_one = compile(
            &FilterExpr::Any {
                clauses: vec![red],
                min: 1,
            },
            &attrs,
            &table,
        );
        assert_eq!(all_one.pre.finite(), any_one.pre.finite());
    }
}
