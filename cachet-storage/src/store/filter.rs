//! Store-native filters.

use cachet_core::{CachetError, CachetResult, FilterExpr, HasId, Specification, StoreError, Versioned};
use serde::Serialize;
use serde_json::Value;

/// Filter language understood by backing stores.
///
/// Unlike [`Specification`] it can also constrain the stored version, which
/// is what optimistic replacement needs.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreFilter<K> {
    All,
    IdEq(K),
    IdIn(Vec<K>),
    VersionEq(i64),
    Field(FilterExpr),
    And(Vec<StoreFilter<K>>),
    Or(Vec<StoreFilter<K>>),
    Not(Box<StoreFilter<K>>),
}

impl<K: PartialEq> StoreFilter<K> {
    /// `id == id && data_version == version`.
    pub fn id_and_version(id: K, version: i64) -> Self {
        StoreFilter::And(vec![StoreFilter::IdEq(id), StoreFilter::VersionEq(version)])
    }

    pub fn matches(&self, id: &K, version: i64, document: &Value) -> CachetResult<bool> {
        match self {
            StoreFilter::All => Ok(true),
            StoreFilter::IdEq(expected) => Ok(expected == id),
            StoreFilter::IdIn(ids) => Ok(ids.contains(id)),
            StoreFilter::VersionEq(expected) => Ok(*expected == version),
            StoreFilter::Field(expr) => expr.matches(document),
            StoreFilter::And(children) => {
                for child in children {
                    if !child.matches(id, version, document)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            StoreFilter::Or(children) => {
                if children.is_empty() {
                    return Ok(true);
                }
                for child in children {
                    if child.matches(id, version, document)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            StoreFilter::Not(inner) => Ok(!inner.matches(id, version, document)?),
        }
    }

    /// Evaluate against a record through its JSON projection.
    pub fn matches_record<R>(&self, record: &R) -> CachetResult<bool>
    where
        R: HasId<Id = K> + Versioned + Serialize,
    {
        let document = serde_json::to_value(record).map_err(|e| {
            CachetError::from(StoreError::Serialization {
                reason: e.to_string(),
            })
        })?;
        self.matches(&record.id(), record.data_version(), &document)
    }
}

/// Translate a specification tree into a store filter.
pub fn to_store_filter<K: Clone>(spec: &Specification<K>) -> StoreFilter<K> {
    match spec {
        Specification::All => StoreFilter::All,
        Specification::ManyIds(ids) => StoreFilter::IdIn(ids.clone()),
        Specification::Field(expr) => StoreFilter::Field(expr.clone()),
        Specification::And(children) => {
            StoreFilter::And(children.iter().map(to_store_filter).collect())
        }
        // An empty disjunction is satisfied everywhere else in the crate.
        Specification::Or(children) if children.is_empty() => StoreFilter::All,
        Specification::Or(children) => {
            StoreFilter::Or(children.iter().map(to_store_filter).collect())
        }
        Specification::Not(inner) => StoreFilter::Not(Box::new(to_store_filter(inner))),
    }
}

impl<K: Clone> From<&Specification<K>> for StoreFilter<K> {
    fn from(spec: &Specification<K>) -> Self {
        to_store_filter(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::EntityHolder;
    use serde_json::json;

    fn record(id: &str, version: i64, color: &str) -> EntityHolder<Value> {
        EntityHolder::new(id, json!({ "color": color })).with_version(version)
    }

    #[test]
    fn test_id_and_version() {
        let filter = StoreFilter::id_and_version("a".to_string(), 3);
        assert!(filter.matches_record(&record("a", 3, "red")).unwrap());
        assert!(!filter.matches_record(&record("a", 4, "red")).unwrap());
        assert!(!filter.matches_record(&record("b", 3, "red")).unwrap());
    }

    #[test]
    fn test_converter_preserves_structure() {
        let spec = Specification::many_ids(vec!["a".to_string()])
            .and(Specification::field(FilterExpr::eq("data.color", json!("red"))))
            .or(Specification::All.negate());

        let filter = to_store_filter(&spec);
        match &filter {
            StoreFilter::Or(children) => {
                assert_eq!(children.len(), 2);
                assert!(matches!(&children[0], StoreFilter::And(inner) if inner.len() == 2));
                assert!(matches!(&children[1], StoreFilter::Not(_)));
            }
            other => panic!("unexpected filter {other:?}"),
        }
        assert!(filter.matches_record(&record("a", 1, "red")).unwrap());
        assert!(!filter.matches_record(&record("a", 1, "blue")).unwrap());
    }

    #[test]
    fn test_converter_agrees_with_in_process_evaluation() {
        let specs = vec![
            Specification::All,
            Specification::many_ids(vec!["b".to_string()]),
            Specification::field(FilterExpr::eq("data.color", json!("blue"))).negate(),
            Specification::Or(vec![]),
            Specification::And(vec![]),
        ];
        let records = vec![record("a", 1, "red"), record("b", 2, "blue")];

        for spec in &specs {
            let filter = to_store_filter(spec);
            for r in &records {
                assert_eq!(
                    spec.is_satisfied_by(r).unwrap(),
                    filter.matches_record(r).unwrap(),
                    "{spec:?} on {}",
                    r.id
                );
            }
        }
    }

    #[test]
    fn test_empty_or_becomes_all() {
        assert_eq!(
            to_store_filter(&Specification::<String>::Or(vec![])),
            StoreFilter::All
        );
    }
}
