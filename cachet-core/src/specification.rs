//! Search specifications
//!
//! A `Specification` is a composable predicate tree over records. Backing
//! stores translate it into their own filter language; it can also be
//! evaluated in-process against a single record.

use crate::{CachetError, CachetResult, FilterExpr, HasId, StoreError, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Predicate tree over records keyed by `K`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Specification<K> {
    /// Every record.
    All,
    /// Records whose id is one of the listed keys.
    ManyIds(Vec<K>),
    /// Single-field comparison on the record's JSON projection.
    Field(FilterExpr),
    /// All children hold. Empty is satisfied.
    And(Vec<Specification<K>>),
    /// Any child holds. Empty is satisfied.
    Or(Vec<Specification<K>>),
    Not(Box<Specification<K>>),
}

impl<K: PartialEq> Specification<K> {
    pub fn many_ids(ids: impl IntoIterator<Item = K>) -> Self {
        Specification::ManyIds(ids.into_iter().collect())
    }

    pub fn field(expr: FilterExpr) -> Self {
        Specification::Field(expr)
    }

    /// Conjunction, flattening nested `And`s.
    pub fn and(self, other: Specification<K>) -> Self {
        match self {
            Specification::And(mut children) => {
                children.push(other);
                Specification::And(children)
            }
            first => Specification::And(vec![first, other]),
        }
    }

    /// Disjunction, flattening nested `Or`s.
    pub fn or(self, other: Specification<K>) -> Self {
        match self {
            Specification::Or(mut children) => {
                children.push(other);
                Specification::Or(children)
            }
            first => Specification::Or(vec![first, other]),
        }
    }

    pub fn negate(self) -> Self {
        Specification::Not(Box::new(self))
    }

    /// Evaluate against a record id and its JSON projection.
    pub fn matches(&self, id: &K, document: &Value) -> CachetResult<bool> {
        match self {
            Specification::All => Ok(true),
            Specification::ManyIds(ids) => Ok(ids.contains(id)),
            Specification::Field(expr) => expr.matches(document),
            Specification::And(children) => {
                for child in children {
                    if !child.matches(id, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Specification::Or(children) => {
                if children.is_empty() {
                    return Ok(true);
                }
                for child in children {
                    if child.matches(id, document)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Specification::Not(inner) => Ok(!inner.matches(id, document)?),
        }
    }

    /// Evaluate against a record.
    pub fn is_satisfied_by<R>(&self, record: &R) -> CachetResult<bool>
    where
        R: HasId<Id = K> + Serialize,
    {
        let document = serde_json::to_value(record).map_err(|e| {
            CachetError::from(StoreError::Serialization {
                reason: e.to_string(),
            })
        })?;
        self.matches(&record.id(), &document)
    }

    /// Check every field expression in the tree is well-formed.
    pub fn validate(&self) -> CachetResult<()> {
        match self {
            Specification::All | Specification::ManyIds(_) => Ok(()),
            Specification::Field(expr) => expr.validate(),
            Specification::And(children) | Specification::Or(children) => {
                children.iter().try_for_each(|c| c.validate())
            }
            Specification::Not(inner) => inner.validate(),
        }
    }
}

// ============================================================================
// SEARCH OPTIONS
// ============================================================================

/// Paging options for searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchOptions {
    /// Maximum number of records to return. `None` means no limit.
    pub limit: Option<usize>,
}

impl SearchOptions {
    pub fn unlimited() -> Self {
        Self { limit: None }
    }

    pub fn with_limit(limit: usize) -> Self {
        Self { limit: Some(limit) }
    }

    /// A zero limit is rejected.
    pub fn validate(&self) -> CachetResult<()> {
        match self.limit {
            Some(0) => Err(ValidationError::InvalidLimit { limit: 0 }.into()),
            _ => Ok(()),
        }
    }
}

/// One page of search results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub items: Vec<T>,
    /// More records matched than the limit allowed.
    pub has_more: bool,
}

impl<T> SearchResult<T> {
    pub fn new(items: Vec<T>, has_more: bool) -> Self {
        Self { items, has_more }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn map<U>(self, f: impl FnMut(T) -> U) -> SearchResult<U> {
        SearchResult {
            items: self.items.into_iter().map(f).collect(),
            has_more: self.has_more,
        }
    }
}
