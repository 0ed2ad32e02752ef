//! Query Filter language
//!
//! A storage-agnostic boolean query over read-model fields, written as JSON:
//!
//! ```text
//! {
//!   "price": { "gt": 100 },
//!   "owner": { "id": { "eq": "u-1" } },
//!   "and":   [ { "sku": { "beginsWith": "A" } }, { "sku": { "contains": "9" } } ],
//!   "not":   { "archived": { "eq": true } }
//! }
//! ```
//!
//! [`FilterExpression::parse`] validates the JSON once into a typed tree.
//! Backends turn that tree into their native predicate through a
//! [`PredicateCompiler`]; two ship with the crate:
//!
//! - `ExpressionCompiler`: condition-expression string with `#name` / `:value` placeholders
//! - `MatcherCompiler`: in-memory predicate used by the bundled read-model stores

mod compiler;
mod matcher;

use std::fmt;

use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

pub use compiler::{CompiledExpression, ExpressionCompiler};
pub use matcher::{compare_values, values_equal, MatcherCompiler, Predicate};

/// Reserved combinator keys
const AND: &str = "and";
const OR: &str = "or";
const NOT: &str = "not";

/// Leaf comparison applied to one property
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    Eq(Value),
    Ne(Value),
    Lt(Value),
    Gt(Value),
    Gte(Value),
    Lte(Value),
    In(Vec<Value>),
    Between(Value, Value),
    /// Substring for strings, membership for arrays
    Contains(Value),
    BeginsWith(String),
    IsDefined(bool),
}

impl Operation {
    /// Parse one `operator: operand` pair
    fn parse(operator: &str, operand: &Value, property: &str) -> Result<Self> {
        let op = match operator {
            "eq" => Operation::Eq(operand.clone()),
            "ne" => Operation::Ne(operand.clone()),
            "lt" => Operation::Lt(scalar(operator, operand, property)?),
            "gt" => Operation::Gt(scalar(operator, operand, property)?),
            "gte" => Operation::Gte(scalar(operator, operand, property)?),
            "lte" => Operation::Lte(scalar(operator, operand, property)?),
            "in" => match operand {
                Value::Array(items) if !items.is_empty() => Operation::In(items.clone()),
                _ => return Err(invalid_operand(operator, property, "a non-empty array")),
            },
            "between" => match operand.as_array().map(Vec::as_slice) {
                Some([low, high]) => Operation::Between(
                    scalar(operator, low, property)?,
                    scalar(operator, high, property)?,
                ),
                _ => return Err(invalid_operand(operator, property, "a [low, high] array")),
            },
            "contains" => Operation::Contains(operand.clone()),
            "beginsWith" => match operand {
                Value::String(prefix) => Operation::BeginsWith(prefix.clone()),
                _ => return Err(invalid_operand(operator, property, "a string")),
            },
            "isDefined" => match operand {
                Value::Bool(defined) => Operation::IsDefined(*defined),
                _ => return Err(invalid_operand(operator, property, "a boolean")),
            },
            unknown => {
                return Err(Error::UnsupportedFilterOperator {
                    operator: unknown.to_string(),
                    property: property.to_string(),
                })
            }
        };
        Ok(op)
    }

    /// Operator name as written in filter JSON
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Eq(_) => "eq",
            Operation::Ne(_) => "ne",
            Operation::Lt(_) => "lt",
            Operation::Gt(_) => "gt",
            Operation::Gte(_) => "gte",
            Operation::Lte(_) => "lte",
            Operation::In(_) => "in",
            Operation::Between(_, _) => "between",
            Operation::Contains(_) => "contains",
            Operation::BeginsWith(_) => "beginsWith",
            Operation::IsDefined(_) => "isDefined",
        }
    }

    fn is_operator(key: &str) -> bool {
        matches!(
            key,
            "eq" | "ne"
                | "lt"
                | "gt"
                | "gte"
                | "lte"
                | "in"
                | "between"
                | "contains"
                | "beginsWith"
                | "isDefined"
        )
    }
}

fn scalar(operator: &str, operand: &Value, property: &str) -> Result<Value> {
    match operand {
        Value::Number(_) | Value::String(_) | Value::Bool(_) => Ok(operand.clone()),
        _ => Err(invalid_operand(operator, property, "a number, string or boolean")),
    }
}

fn invalid_operand(operator: &str, property: &str, expected: &str) -> Error {
    Error::InvalidFilter(format!(
        "operator '{}' on '{}' expects {}",
        operator, property, expected
    ))
}

/// Typed filter tree
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub enum FilterExpression {
    /// All children must hold; an empty list matches everything
    And(Vec<FilterExpression>),
    Or(Vec<FilterExpression>),
    Not(Box<FilterExpression>),
    Condition {
        path: Vec<String>,
        operation: Operation,
    },
}

impl FilterExpression {
    /// A filter that matches every record
    pub fn match_all() -> Self {
        FilterExpression::And(Vec::new())
    }

    /// Condition on a dotted property path
    pub fn condition(path: &str, operation: Operation) -> Self {
        FilterExpression::Condition {
            path: path.split('.').map(str::to_string).collect(),
            operation,
        }
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, FilterExpression::And(children) if children.is_empty())
    }

    /// Parse and validate filter JSON
    ///
    /// The root must be an object. `{}` matches everything; nested
    /// combinators must not be empty.
    pub fn parse(raw: &Value) -> Result<Self> {
        match raw {
            Value::Object(map) => parse_object(map, &[]),
            _ => Err(Error::InvalidFilter("filter must be a JSON object".into())),
        }
    }
}

impl TryFrom<Value> for FilterExpression {
    type Error = Error;

    fn try_from(raw: Value) -> Result<Self> {
        FilterExpression::parse(&raw)
    }
}

impl fmt::Display for FilterExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterExpression::And(children) | FilterExpression::Or(children) => {
                let joiner = if matches!(self, FilterExpression::And(_)) {
                    " and "
                } else {
                    " or "
                };
                write!(f, "(")?;
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{}", joiner)?;
                    }
                    write!(f, "{}", child)?;
                }
                write!(f, ")")
            }
            FilterExpression::Not(child) => write!(f, "not {}", child),
            FilterExpression::Condition { path, operation } => {
                write!(f, "{} {}", path.join("."), operation.name())
            }
        }
    }
}

/// Parse an expression object; `prefix` is the property path it is nested under
fn parse_object(map: &Map<String, Value>, prefix: &[String]) -> Result<FilterExpression> {
    let mut parts = Vec::with_capacity(map.len());

    for (key, value) in map {
        match key.as_str() {
            AND | OR if prefix.is_empty() => {
                let children = parse_children(key, value)?;
                parts.push(if key == AND {
                    FilterExpression::And(children)
                } else {
                    FilterExpression::Or(children)
                });
            }
            NOT if prefix.is_empty() => match value {
                Value::Object(inner) if !inner.is_empty() => {
                    parts.push(FilterExpression::Not(Box::new(parse_object(inner, &[])?)));
                }
                _ => {
                    return Err(Error::InvalidFilter(
                        "'not' expects exactly one non-empty expression".into(),
                    ))
                }
            },
            property => {
                let mut path = prefix.to_vec();
                path.push(property.to_string());
                parts.push(parse_property(&path, value)?);
            }
        }
    }

    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => FilterExpression::And(parts),
    })
}

fn parse_children(key: &str, value: &Value) -> Result<Vec<FilterExpression>> {
    let items = match value {
        Value::Array(items) if !items.is_empty() => items,
        _ => {
            return Err(Error::InvalidFilter(format!(
                "'{}' expects a non-empty array of expressions",
                key
            )))
        }
    };

    items
        .iter()
        .map(|item| match item {
            Value::Object(map) if !map.is_empty() => parse_object(map, &[]),
            _ => Err(Error::InvalidFilter(format!(
                "every '{}' entry must be a non-empty object",
                key
            ))),
        })
        .collect()
}

/// Parse the value of a property key: operations, nested properties, or both
fn parse_property(path: &[String], value: &Value) -> Result<FilterExpression> {
    let property = path.join(".");
    let map = match value {
        Value::Object(map) if !map.is_empty() => map,
        _ => {
            return Err(Error::InvalidFilter(format!(
                "property '{}' expects an object of operations",
                property
            )))
        }
    };

    let mut parts = Vec::with_capacity(map.len());
    for (key, operand) in map {
        if Operation::is_operator(key) {
            parts.push(FilterExpression::Condition {
                path: path.to_vec(),
                operation: Operation::parse(key, operand, &property)?,
            });
        } else if let Value::Object(nested) = operand {
            let mut nested_path = path.to_vec();
            nested_path.push(key.clone());
            parts.push(parse_property(&nested_path, &Value::Object(nested.clone()))?);
        } else {
            return Err(Error::UnsupportedFilterOperator {
                operator: key.clone(),
                property,
            });
        }
    }

    Ok(match parts.len() {
        1 => parts.remove(0),
        _ => FilterExpression::And(parts),
    })
}

/// Turns a filter tree into a backend's native predicate
///
/// Implementations must be pure tree transforms.
pub trait PredicateCompiler {
    type Output;

    fn compile(&self, filter: &FilterExpression) -> Result<Self::Output>;

    /// Parse filter JSON and compile it
    fn compile_json(&self, raw: &Value) -> Result<Self::Output> {
        self.compile(&FilterExpression::parse(raw)?)
    }
}
