//! Error types for cachet operations

use thiserror::Error;

/// Optimistic-concurrency and locking errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConcurrencyError {
    /// A write lost an optimistic-concurrency race.
    ///
    /// Batch-level conflicts carry no id and no versions.
    #[error("Version mismatch. Id={id:?}, CurrentVersion={current_version:?}, UpdateVersion={update_version:?}")]
    VersionMismatch {
        id: Option<String>,
        current_version: Option<i64>,
        update_version: Option<i64>,
    },

    #[error("Invalid DataVersion. DataVersion={version}")]
    InvalidVersion { version: i64 },

    #[error("Lock acquisition failed for {key}: {reason}")]
    LockAcquisitionFailed { key: String, reason: String },
}

impl ConcurrencyError {
    /// Version mismatch for a single record.
    pub fn version_mismatch(
        id: impl Into<String>,
        current_version: Option<i64>,
        update_version: Option<i64>,
    ) -> Self {
        ConcurrencyError::VersionMismatch {
            id: Some(id.into()),
            current_version,
            update_version,
        }
    }

    /// Version mismatch for a whole batch, with no item identified.
    pub fn batch_version_mismatch() -> Self {
        ConcurrencyError::VersionMismatch {
            id: None,
            current_version: None,
            update_version: None,
        }
    }
}

/// Backing store errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Duplicate key {id} in {collection}")]
    DuplicateKey { collection: String, id: String },

    #[error("Backing store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Query on {collection} failed: {reason}")]
    QueryFailed { collection: String, reason: String },

    #[error("Write to {collection} failed: {reason}")]
    WriteFailed { collection: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Validation errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Limit is wrong: {limit}")]
    InvalidLimit { limit: usize },

    #[error("Invalid filter on {field}: {reason}")]
    InvalidFilter { field: String, reason: String },

    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all cachet errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CachetError {
    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CachetError {
    /// Whether this error is an optimistic-concurrency conflict.
    ///
    /// Callers treat these as "reload and retry" rather than fatal.
    pub fn is_version_mismatch(&self) -> bool {
        matches!(
            self,
            CachetError::Concurrency(ConcurrencyError::VersionMismatch { .. })
        )
    }
}

/// Result type alias for cachet operations.
pub type CachetResult<T> = Result<T, CachetError>;

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_display() {
        let err = ConcurrencyError::version_mismatch("a", Some(2), Some(2));
        let msg = format!("{}", err);
        assert!(msg.contains("Version mismatch"));
        assert!(msg.contains("\"a\""));
        assert!(msg.contains("CurrentVersion=Some(2)"));
        assert!(msg.contains("UpdateVersion=Some(2)"));
    }

    #[test]
    fn test_batch_version_mismatch_has_no_id() {
        match ConcurrencyError::batch_version_mismatch() {
            ConcurrencyError::VersionMismatch {
                id,
                current_version,
                update_version,
            } => {
                assert!(id.is_none());
                assert!(current_version.is_none());
                assert!(update_version.is_none());
            }
            other => panic!("unexpected variant {:?}", other),
        }
    }

    #[test]
    fn test_invalid_version_display() {
        let err = ConcurrencyError::InvalidVersion { version: 0 };
        assert!(format!("{}", err).contains("DataVersion=0"));
    }

    #[test]
    fn test_store_error_display_duplicate_key() {
        let err = StoreError::DuplicateKey {
            collection: "widgets".to_string(),
            id: "a".to_string(),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("Duplicate key"));
        assert!(msg.contains("widgets"));
    }

    #[test]
    fn test_is_version_mismatch() {
        let conflict = CachetError::from(ConcurrencyError::batch_version_mismatch());
        assert!(conflict.is_version_mismatch());

        let invalid = CachetError::from(ConcurrencyError::InvalidVersion { version: -1 });
        assert!(!invalid.is_version_mismatch());

        let store = CachetError::from(StoreError::LockPoisoned);
        assert!(!store.is_version_mismatch());
    }

    #[test]
    fn test_cachet_error_from_variants() {
        let store = CachetError::from(StoreError::LockPoisoned);
        assert!(matches!(store, CachetError::Store(_)));

        let validation = CachetError::from(ValidationError::InvalidLimit { limit: 0 });
        assert!(matches!(validation, CachetError::Validation(_)));

        let config = CachetError::from(ConfigError::MissingRequired {
            field: "name".to_string(),
        });
        assert!(matches!(config, CachetError::Config(_)));

        let concurrency = CachetError::from(ConcurrencyError::LockAcquisitionFailed {
            key: "a".to_string(),
            reason: "timeout".to_string(),
        });
        assert!(matches!(concurrency, CachetError::Concurrency(_)));
    }
}
