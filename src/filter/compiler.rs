//! Condition-expression backend
//!
//! Emits the string form used by key-value stores with expression filters:
//! attribute names are replaced by `#name` placeholders and operands by
//! `:value` placeholders, returned alongside the expression.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};

use super::{FilterExpression, Operation, PredicateCompiler};

/// A compiled condition expression with its placeholder maps
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompiledExpression {
    /// Empty when the filter matches everything
    pub expression: String,
    /// `#placeholder` -> attribute name
    pub attribute_names: BTreeMap<String, String>,
    /// `:placeholder` -> operand
    pub attribute_values: BTreeMap<String, Value>,
}

impl CompiledExpression {
    pub fn is_empty(&self) -> bool {
        self.expression.is_empty()
    }
}

/// Compiles filters into condition-expression strings
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionCompiler;

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self
    }
}

impl PredicateCompiler for ExpressionCompiler {
    type Output = CompiledExpression;

    fn compile(&self, filter: &FilterExpression) -> Result<CompiledExpression> {
        if filter.is_match_all() {
            return Ok(CompiledExpression::default());
        }

        let mut state = CompileState::default();
        let expression = state.node(filter, &[], true)?;
        Ok(CompiledExpression {
            expression,
            attribute_names: state.names,
            attribute_values: state.values,
        })
    }
}

#[derive(Default)]
struct CompileState {
    names: BTreeMap<String, String>,
    /// raw attribute name -> placeholder
    name_placeholders: BTreeMap<String, String>,
    values: BTreeMap<String, Value>,
}

impl CompileState {
    /// Compile one node; `scope` is the branch indices leading to it
    fn node(&mut self, node: &FilterExpression, scope: &[usize], top: bool) -> Result<String> {
        match node {
            FilterExpression::And(children) => self.combinator(children, " AND ", scope, top),
            FilterExpression::Or(children) => self.combinator(children, " OR ", scope, top),
            FilterExpression::Not(child) => {
                let inner = self.node(child, &child_scope(scope, 0), true)?;
                Ok(format!("NOT ({})", inner))
            }
            FilterExpression::Condition { path, operation } => {
                self.condition(path, operation, scope)
            }
        }
    }

    fn combinator(
        &mut self,
        children: &[FilterExpression],
        joiner: &str,
        scope: &[usize],
        top: bool,
    ) -> Result<String> {
        if children.is_empty() {
            return Err(Error::InvalidFilter(
                "nested combinators must not be empty".into(),
            ));
        }

        let parts = children
            .iter()
            .enumerate()
            .map(|(index, child)| self.node(child, &child_scope(scope, index), false))
            .collect::<Result<Vec<_>>>()?;

        let joined = parts.join(joiner);
        if top || parts.len() == 1 {
            Ok(joined)
        } else {
            Ok(format!("({})", joined))
        }
    }

    fn condition(&mut self, path: &[String], operation: &Operation, scope: &[usize]) -> Result<String> {
        if path.is_empty() {
            return Err(Error::InvalidFilter("condition without a property".into()));
        }

        let name = path
            .iter()
            .map(|segment| self.name_placeholder(segment))
            .collect::<Vec<_>>()
            .join(".");

        let base = format!(
            ":{}_{}{}",
            path.iter().map(|s| sanitize(s)).collect::<Vec<_>>().join("_"),
            operation.name(),
            scope.iter().map(|i| format!("_{}", i)).collect::<String>()
        );

        let expression = match operation {
            Operation::Eq(v) => format!("{} = {}", name, self.value(&base, v)),
            Operation::Ne(v) => format!("{} <> {}", name, self.value(&base, v)),
            Operation::Lt(v) => format!("{} < {}", name, self.value(&base, v)),
            Operation::Gt(v) => format!("{} > {}", name, self.value(&base, v)),
            Operation::Gte(v) => format!("{} >= {}", name, self.value(&base, v)),
            Operation::Lte(v) => format!("{} <= {}", name, self.value(&base, v)),
            Operation::In(items) => {
                let placeholders: Vec<String> = items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| self.value(&format!("{}_{}", base, i), v))
                    .collect();
                format!("{} IN ({})", name, placeholders.join(", "))
            }
            Operation::Between(low, high) => format!(
                "{} BETWEEN {} AND {}",
                name,
                self.value(&format!("{}_lo", base), low),
                self.value(&format!("{}_hi", base), high)
            ),
            Operation::Contains(v) => format!("contains({}, {})", name, self.value(&base, v)),
            Operation::BeginsWith(prefix) => format!(
                "begins_with({}, {})",
                name,
                self.value(&base, &Value::String(prefix.clone()))
            ),
            Operation::IsDefined(true) => format!("attribute_exists({})", name),
            Operation::IsDefined(false) => format!("attribute_not_exists({})", name),
        };
        Ok(expression)
    }

    fn value(&mut self, placeholder: &str, operand: &Value) -> String {
        self.values.insert(placeholder.to_string(), operand.clone());
        placeholder.to_string()
    }

    /// Stable placeholder per raw name; sanitizing collisions get a suffix
    fn name_placeholder(&mut self, raw: &str) -> String {
        if let Some(existing) = self.name_placeholders.get(raw) {
            return existing.clone();
        }

        let base = format!("#{}", sanitize(raw));
        let mut candidate = base.clone();
        let mut suffix = 1;
        while self.names.contains_key(&candidate) {
            candidate = format!("{}_{}", base, suffix);
            suffix += 1;
        }

        self.names.insert(candidate.clone(), raw.to_string());
        self.name_placeholders.insert(raw.to_string(), candidate.clone());
        candidate
    }
}

fn child_scope(scope: &[usize], index: usize) -> Vec<usize> {
    let mut child = scope.to_vec();
    child.push(index);
    child
}

fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "_".to_string()
    } else {
        cleaned
    }
}
