//! Field filter expressions
//!
//! A `FilterExpr` compares one field of a record's JSON projection against a
//! value. Logical composition lives in [`crate::Specification`]; this module
//! only knows single-field predicates. Fields may be dotted paths
//! (`"data.value"`).

use crate::{CachetResult, ValidationError};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Contains substring (strings) or element (arrays)
    Contains,
    /// In list of values
    In,
    /// Matches regular expression
    Regex,
    /// Field is present and not null
    Exists,
}

/// Single-field filter expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    /// Create a new filter expression.
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            field: field.into(),
            operator,
            value,
        }
    }

    /// Create an equality filter.
    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    /// Create a contains filter.
    pub fn contains(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Contains, value)
    }

    /// Create a membership filter.
    pub fn one_of(field: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    pub fn gt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: Value) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    /// Create a regex filter.
    pub fn regex(field: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::Regex, Value::String(pattern.into()))
    }

    /// Check the expression is well-formed without evaluating it.
    pub fn validate(&self) -> CachetResult<()> {
        match self.operator {
            FilterOperator::In if !self.value.is_array() => {
                Err(self.invalid("In expects an array").into())
            }
            FilterOperator::Regex => self.compiled_regex().map(|_| ()),
            _ => Ok(()),
        }
    }

    /// Evaluate against a record's JSON projection.
    ///
    /// A missing field compares as `null`.
    pub fn matches(&self, document: &Value) -> CachetResult<bool> {
        let actual = lookup(document, &self.field).unwrap_or(&Value::Null);
        let result = match self.operator {
            FilterOperator::Eq => values_equal(actual, &self.value),
            FilterOperator::Ne => !values_equal(actual, &self.value),
            FilterOperator::Gt => compare(actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare(actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (actual, &self.value) {
                (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
                (Value::Array(items), needle) => items.iter().any(|item| values_equal(item, needle)),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(candidates) => candidates.iter().any(|c| values_equal(actual, c)),
                _ => return Err(self.invalid("In expects an array").into()),
            },
            FilterOperator::Regex => match actual {
                Value::String(text) => self.compiled_regex()?.is_match(text),
                _ => false,
            },
            FilterOperator::Exists => !actual.is_null(),
        };
        Ok(result)
    }

    fn compiled_regex(&self) -> CachetResult<Regex> {
        let pattern = self
            .value
            .as_str()
            .ok_or_else(|| self.invalid("Regex expects a string pattern"))?;
        Regex::new(pattern).map_err(|e| self.invalid(&e.to_string()).into())
    }

    fn invalid(&self, reason: &str) -> ValidationError {
        ValidationError::InvalidFilter {
            field: self.field.clone(),
            reason: reason.to_string(),
        }
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn lookup<'a>(document: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(document, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc() -> Value {
        json!({
            "id": "a",
            "data_version": 3,
            "data": { "value": "hello world", "tags": ["red", "blue"], "score": 4.5 }
        })
    }

    #[test]
    fn test_eq_on_nested_field() {
        assert!(FilterExpr::eq("data.value", json!("hello world")).matches(&doc()).unwrap());
        assert!(!FilterExpr::eq("data.value", json!("nope")).matches(&doc()).unwrap());
    }

    #[test]
    fn test_numeric_comparisons_cross_int_and_float() {
        assert!(FilterExpr::eq("data_version", json!(3.0)).matches(&doc()).unwrap());
        assert!(FilterExpr::gt("data.score", json!(4)).matches(&doc()).unwrap());
        assert!(FilterExpr::lt("data_version", json!(10)).matches(&doc()).unwrap());
        let gte = FilterExpr::new("data_version", FilterOperator::Gte, json!(3));
        assert!(gte.matches(&doc()).unwrap());
    }

    #[test]
    fn test_contains_string_and_array() {
        assert!(FilterExpr::contains("data.value", json!("world")).matches(&doc()).unwrap());
        assert!(FilterExpr::contains("data.tags", json!("blue")).matches(&doc()).unwrap());
        assert!(!FilterExpr::contains("data.tags", json!("green")).matches(&doc()).unwrap());
    }

    #[test]
    fn test_in_requires_array() {
        let ok = FilterExpr::one_of("id", vec![json!("a"), json!("b")]);
        assert!(ok.matches(&doc()).unwrap());

        let bad = FilterExpr::new("id", FilterOperator::In, json!("a"));
        assert!(bad.validate().is_err());
        assert!(bad.matches(&doc()).is_err());
    }

    #[test]
    fn test_regex_and_invalid_pattern() {
        assert!(FilterExpr::regex("data.value", "^hello").matches(&doc()).unwrap());
        assert!(FilterExpr::regex("data.value", "(").validate().is_err());
    }

    #[test]
    fn test_missing_field_is_null() {
        let exists = FilterExpr::new("data.missing", FilterOperator::Exists, Value::Null);
        assert!(!exists.matches(&doc()).unwrap());
        assert!(FilterExpr::eq("data.missing", Value::Null).matches(&doc()).unwrap());
    }
}
