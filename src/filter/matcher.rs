//! In-memory backend
//!
//! Compiles a filter into a closure evaluated directly against record
//! fields. Operands of a different JSON type than the stored value never
//! match; numbers compare as `f64`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::Result;
use crate::types::{lookup_path, ReadModelRecord};

use super::{FilterExpression, Operation, PredicateCompiler};

type MatchFn = dyn Fn(&Map<String, Value>) -> bool + Send + Sync;

/// Compiled in-memory predicate over a record's fields
#[derive(Clone)]
pub struct Predicate(Arc<MatchFn>);

impl Predicate {
    /// Predicate that accepts every record
    pub fn always() -> Self {
        Predicate(Arc::new(|_| true))
    }

    pub fn matches(&self, fields: &Map<String, Value>) -> bool {
        (self.0)(fields)
    }

    pub fn matches_record(&self, record: &ReadModelRecord) -> bool {
        self.matches(&record.fields)
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Predicate(..)")
    }
}

/// Compiles filters into [`Predicate`]s
#[derive(Debug, Clone, Copy, Default)]
pub struct MatcherCompiler;

impl MatcherCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl PredicateCompiler for MatcherCompiler {
    type Output = Predicate;

    fn compile(&self, filter: &FilterExpression) -> Result<Predicate> {
        Ok(Predicate(build(filter)))
    }
}

fn build(node: &FilterExpression) -> Arc<MatchFn> {
    match node {
        FilterExpression::And(children) => {
            let children: Vec<_> = children.iter().map(build).collect();
            Arc::new(move |fields| children.iter().all(|child| child(fields)))
        }
        FilterExpression::Or(children) => {
            let children: Vec<_> = children.iter().map(build).collect();
            Arc::new(move |fields| children.iter().any(|child| child(fields)))
        }
        FilterExpression::Not(child) => {
            let child = build(child);
            Arc::new(move |fields| !child(fields))
        }
        FilterExpression::Condition { path, operation } => {
            let path = path.clone();
            let operation = operation.clone();
            Arc::new(move |fields| evaluate(lookup_path(fields, &path), &operation))
        }
    }
}

fn evaluate(value: Option<&Value>, operation: &Operation) -> bool {
    let Some(value) = value else {
        return matches!(operation, Operation::IsDefined(false));
    };

    match operation {
        Operation::Eq(expected) => values_equal(value, expected),
        Operation::Ne(expected) => !values_equal(value, expected),
        Operation::Lt(expected) => compare_values(value, expected) == Some(Ordering::Less),
        Operation::Gt(expected) => compare_values(value, expected) == Some(Ordering::Greater),
        Operation::Gte(expected) => matches!(
            compare_values(value, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Operation::Lte(expected) => matches!(
            compare_values(value, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Operation::In(candidates) => candidates.iter().any(|c| values_equal(value, c)),
        Operation::Between(low, high) => {
            matches!(
                compare_values(value, low),
                Some(Ordering::Greater | Ordering::Equal)
            ) && matches!(
                compare_values(value, high),
                Some(Ordering::Less | Ordering::Equal)
            )
        }
        Operation::Contains(needle) => match (value, needle) {
            (Value::String(text), Value::String(part)) => text.contains(part.as_str()),
            (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
            _ => false,
        },
        Operation::BeginsWith(prefix) => value
            .as_str()
            .map_or(false, |text| text.starts_with(prefix.as_str())),
        Operation::IsDefined(defined) => *defined,
    }
}

/// Order two scalars of the same JSON type; `None` across types
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality with numbers compared by value (`1 == 1.0`)
pub fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn predicate(raw: Value) -> Predicate {
        MatcherCompiler::new().compile_json(&raw).unwrap()
    }

    fn fields(raw: Value) -> Map<String, Value> {
        raw.as_object().cloned().unwrap()
    }

    #[test]
    fn test_price_and_sku_round_trip() {
        let p = predicate(json!({
            "price": {"gt": 100},
            "and": [{"sku": {"beginsWith": "A"}}, {"sku": {"contains": "9"}}]
        }));

        assert!(p.matches(&fields(json!({"price": 150, "sku": "A-19"}))));
        assert!(!p.matches(&fields(json!({"price": 100, "sku": "A-19"}))));
        assert!(!p.matches(&fields(json!({"price": 150, "sku": "B-19"}))));
        assert!(!p.matches(&fields(json!({"price": 150, "sku": "A-11"}))));
        assert!(!p.matches(&fields(json!({"sku": "A-19"}))));
    }

    #[test]
    fn test_type_mismatch_never_matches() {
        let p = predicate(json!({"price": {"gt": 100}}));
        assert!(!p.matches(&fields(json!({"price": "150"}))));

        let p = predicate(json!({"price": {"eq": 1}}));
        assert!(p.matches(&fields(json!({"price": 1.0}))));
        assert!(!p.matches(&fields(json!({"price": "1"}))));
    }

    #[test]
    fn test_nested_paths_and_negation() {
        let p = predicate(json!({
            "owner": {"id": {"in": ["u-1", "u-2"]}},
            "not": {"archived": {"eq": true}}
        }));

        assert!(p.matches(&fields(json!({"owner": {"id": "u-2"}}))));
        assert!(p.matches(&fields(json!({"owner": {"id": "u-1"}, "archived": false}))));
        assert!(!p.matches(&fields(json!({"owner": {"id": "u-1"}, "archived": true}))));
        assert!(!p.matches(&fields(json!({"owner": {"id": "u-3"}}))));
    }

    #[test]
    fn test_between_contains_array_and_is_defined() {
        let p = predicate(json!({"price": {"between": [10, 20]}}));
        assert!(p.matches(&fields(json!({"price": 10}))));
        assert!(p.matches(&fields(json!({"price": 20}))));
        assert!(!p.matches(&fields(json!({"price": 21}))));

        let p = predicate(json!({"tags": {"contains": "red"}}));
        assert!(p.matches(&fields(json!({"tags": ["blue", "red"]}))));
        assert!(!p.matches(&fields(json!({"tags": ["blue"]}))));

        let p = predicate(json!({"deletedAt": {"isDefined": false}}));
        assert!(p.matches(&fields(json!({"name": "x"}))));
        assert!(!p.matches(&fields(json!({"deletedAt": null}))));
    }

    #[test]
    fn test_match_all() {
        assert!(predicate(json!({})).matches(&Map::new()));
        assert!(Predicate::always().matches(&Map::new()));
    }
}
