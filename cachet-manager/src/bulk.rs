//! Per-item outcome of a bulk update.

use cachet_core::CachetError;
use serde::{Deserialize, Serialize};

/// Result of one command inside a bulk update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteItem {
    /// Saved id on success; the command's own id (if any) on failure.
    pub entity_id: Option<String>,
    pub is_ok: bool,
    pub error: Option<String>,
}

impl BulkWriteItem {
    pub fn ok(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            is_ok: true,
            error: None,
        }
    }

    pub fn failed(entity_id: Option<String>, error: &CachetError) -> Self {
        Self {
            entity_id,
            is_ok: false,
            error: Some(error.to_string()),
        }
    }
}

/// Outcome of a bulk update, one item per command in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkWriteResult {
    pub items: Vec<BulkWriteItem>,
}

impl BulkWriteResult {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn succeeded(&self) -> usize {
        self.items.iter().filter(|item| item.is_ok).count()
    }

    pub fn failed(&self) -> usize {
        self.len() - self.succeeded()
    }

    pub fn all_ok(&self) -> bool {
        self.items.iter().all(|item| item.is_ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachet_core::ConcurrencyError;

    #[test]
    fn test_counts() {
        let conflict = CachetError::from(ConcurrencyError::version_mismatch("b", Some(2), Some(2)));
        let result = BulkWriteResult {
            items: vec![
                BulkWriteItem::ok("a"),
                BulkWriteItem::failed(Some("b".to_string()), &conflict),
                BulkWriteItem::ok("c"),
            ],
        };

        assert_eq!(result.len(), 3);
        assert_eq!(result.succeeded(), 2);
        assert_eq!(result.failed(), 1);
        assert!(!result.all_ok());
        assert!(result.items[1]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Version mismatch")));
    }

    #[test]
    fn test_empty_result_is_all_ok() {
        let result = BulkWriteResult::default();
        assert!(result.is_empty());
        assert!(result.all_ok());
    }

    #[test]
    fn test_serializes_to_json() {
        let item = BulkWriteItem::ok("a");
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json["entity_id"], "a");
        assert_eq!(json["is_ok"], true);
        assert!(json["error"].is_null());
    }
}
