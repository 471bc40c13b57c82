use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scalar attribute value. Equality is type-strict; numeric range queries
/// coerce `Int` and `Float` to f64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            #[allow(clippy::cast_precision_loss)]
            AttrValue::Int(i) => Some(*i as f64),
            AttrValue::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(f: f64) -> Self {
        AttrValue::Float(f)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// One attribute slot: absent-but-present (`Null`), a scalar, or an array.
/// Arrays produce one equality entry per element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrPayload {
    Many(Vec<AttrValue>),
    One(AttrValue),
    Null,
}

impl AttrPayload {
    /// Iterates the scalar values carried by this payload.
    pub fn values(&self) -> impl Iterator<Item = &AttrValue> {
        match self {
            AttrPayload::Many(vs) => vs.iter(),
            AttrPayload::One(v) => std::slice::from_ref(v).iter(),
            AttrPayload::Null => [].iter(),
        }
    }
}

pub type AttrRecord = HashMap<String, AttrPayload>;

/// Which side of a record a leaf inspects: the indexed attribute record or
/// the opaque metadata blob (interpreted as JSON at evaluation time).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterScope {
    #[default]
    Attr,
    Meta,
}

/// Numeric bounds with independently inclusive/exclusive ends.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RangeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
}

impl RangeSpec {
    pub fn contains(&self, x: f64) -> bool {
        if let Some(b) = self.gt {
            if x <= b {
                return false;
            }
        }
        if let Some(b) = self.gte {
            if x < b {
                return false;
            }
        }
        if let Some(b) = self.lt {
            if x >= b {
                return false;
            }
        }
        if let Some(b) = self.lte {
            if x > b {
                return false;
            }
        }
        true
    }
}

/// Boolean filter tree compiled to a candidate-id set before ANN search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterExpr {
    Match {
        key: String,
        value: AttrValue,
        #[serde(default)]
        scope: FilterScope,
    },
    Exists {
        key: String,
        #[serde(default)]
        scope: FilterScope,
    },
    Range {
        key: String,
        range: RangeSpec,
        #[serde(default)]
        scope: FilterScope,
    },
    HasId {
        values: Vec<u32>,
    },
    All(Vec<FilterExpr>),
    Any {
        clauses: Vec<FilterExpr>,
        #[serde(default = "default_min")]
        min: usize,
    },
    Not(Box<FilterExpr>),
}

fn default_min() -> usize {
    1
}

impl FilterExpr {
    pub fn eq(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        FilterExpr::Match {
            key: key.into(),
            value: value.into(),
            scope: FilterScope::Attr,
        }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        FilterExpr::Exists {
            key: key.into(),
            scope: FilterScope::Attr,
        }
    }

    pub fn range(key: impl Into<String>, range: RangeSpec) -> Self {
        FilterExpr::Range {
            key: key.into(),
            range,
            scope: FilterScope::Attr,
        }
    }
}

/// Top-level query alias mirroring the familiar must/should/must_not shape.
/// Compiles down to the [`FilterExpr`] algebra.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default)]
    pub must: Vec<FilterExpr>,
    #[serde(default)]
    pub should: Vec<FilterExpr>,
    #[serde(default = "default_min")]
    pub should_min: usize,
    #[serde(default)]
    pub must_not: Vec<FilterExpr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_id: Option<Vec<u32>>,
}

impl Filter {
    pub fn into_expr(self) -> Option<FilterExpr> {
        let mut clauses = self.must;
        if !self.should.is_empty() {
            clauses.push(FilterExpr::Any {
                clauses: self.should,
                min: self.should_min,
            });
        }
        for c in self.must_not {
            clauses.push(FilterExpr::Not(Box::new(c)));
        }
        if let Some(ids) = self.has_id {
            clauses.push(FilterExpr::HasId { values: ids });
        }
        match clauses.len() {
            0 => None,
            1 => clauses.pop(),
            _ => Some(FilterExpr::All(clauses)),
        }
    }
}

impl From<FilterExpr> for Filter {
    fn from(expr: FilterExpr) -> Self {
        Filter {
            must: vec![expr],
            ..Filter::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_mixed_bounds() {
        let r = RangeSpec {
            gte: Some(10.0),
            lt: Some(20.0),
            ..RangeSpec::default()
        };
        assert!(r.contains(10.0));
        assert!(r.contains(19.9));
        assert!(!r.contains(20.0));
        assert!(!r.contains(9.9));
    }

    #[test]
    fn filter_alias_compiles_to_all() {
        let f = Filter {
            must: vec![FilterExpr::eq("color", "red")],
            must_not: vec![FilterExpr::exists("archived")],
            ..Filter::default()
        };
        let expr = f.into_expr().unwrap();
        match expr {
            FilterExpr::All(cs) => assert_eq!(cs.len(), 2),
            other => panic!("expected All, got {other:?}"),
        }
    }

    #[test]
    fn attr_value_untagged_json() {
        let v: AttrValue = serde_json::from_str("\"red\"").unwrap();
        assert_eq!(v, AttrValue::Str("red".into()));
        let v: AttrValue = serde_json::from_str("10").unwrap();
        assert_eq!(v, AttrValue::Int(10));
        let v: AttrValue = serde_json::from_str("10.5").unwrap();
        assert_eq!(v, AttrValue::Float(10.5));
        let v: AttrValue = serde_json::from_str("true").unwrap();
        assert_eq!(v, AttrValue::Bool(true));
    }
}
