//! Entity identity and versioning.
//!
//! Every stored aggregate carries an id and an integer `data_version`.
//! Versions start at [`INITIAL_DATA_VERSION`] and grow by one per write.

use crate::Timestamp;
use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fmt::{Debug, Display};
use std::hash::Hash;

/// Version stamped on a record when it is first created.
pub const INITIAL_DATA_VERSION: i64 = 1;

/// Types with a stable identity.
pub trait HasId {
    /// Key type. Must be totally ordered so multi-key locks can be sorted.
    type Id: Clone + Eq + Ord + Hash + Debug + Display + Send + Sync + 'static;

    fn id(&self) -> Self::Id;
}

/// Types carrying an optimistic-concurrency version.
pub trait Versioned {
    fn data_version(&self) -> i64;

    fn set_data_version(&mut self, version: i64);
}

/// A record that can be cached and persisted through a versioned store.
pub trait Entity:
    HasId + Versioned + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> Entity for T where
    T: HasId + Versioned + Clone + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

// ============================================================================
// ENTITY HOLDER
// ============================================================================

/// Generic stored aggregate wrapping a payload with id, version and audit fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityHolder<T> {
    pub id: String,
    pub data_version: i64,
    pub created_date: Timestamp,
    pub modified_date: Option<Timestamp>,
    pub created_by: Option<String>,
    pub modified_by: Option<String>,
    pub application: Option<String>,
    pub data: T,
}

impl<T> EntityHolder<T> {
    /// A holder at the initial version, created now.
    pub fn new(id: impl Into<String>, data: T) -> Self {
        Self {
            id: id.into(),
            data_version: INITIAL_DATA_VERSION,
            created_date: Utc::now(),
            modified_date: None,
            created_by: None,
            modified_by: None,
            application: None,
            data,
        }
    }

    /// Same holder with a different version.
    pub fn with_version(mut self, version: i64) -> Self {
        self.data_version = version;
        self
    }

    /// The holder that would follow this one: same id, version + 1, new payload.
    pub fn next(&self, data: T) -> Self {
        Self {
            id: self.id.clone(),
            data_version: self.data_version + 1,
            created_date: self.created_date,
            modified_date: Some(Utc::now()),
            created_by: self.created_by.clone(),
            modified_by: self.modified_by.clone(),
            application: self.application.clone(),
            data,
        }
    }
}

impl<T> HasId for EntityHolder<T> {
    type Id = String;

    fn id(&self) -> String {
        self.id.clone()
    }
}

impl<T> Versioned for EntityHolder<T> {
    fn data_version(&self) -> i64 {
        self.data_version
    }

    fn set_data_version(&mut self, version: i64) {
        self.data_version = version;
    }
}

// ============================================================================
// WRITE COMMAND
// ============================================================================

/// A request to create or update an entity.
///
/// A missing `entity_id` means "create"; a missing `data_version` means
/// "whatever comes after the stored version".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteCommand<T> {
    pub entity_id: Option<String>,
    pub data_version: Option<i64>,
    pub application: Option<String>,
    pub user: Option<String>,
    pub operation_id: Option<String>,
    pub update: T,
    #[serde(default = "Utc::now")]
    pub created_time: Timestamp,
}

impl<T: Clone> WriteCommand<T> {
    /// Command creating a new entity.
    pub fn create(update: T) -> Self {
        Self {
            entity_id: None,
            data_version: None,
            application: None,
            user: None,
            operation_id: None,
            update,
            created_time: Utc::now(),
        }
    }

    /// Command updating an existing entity.
    pub fn update(entity_id: impl Into<String>, update: T) -> Self {
        Self {
            entity_id: Some(entity_id.into()),
            ..Self::create(update)
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.data_version = Some(version);
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn with_application(mut self, application: impl Into<String>) -> Self {
        self.application = Some(application.into());
        self
    }

    /// Build the holder this command persists.
    pub fn create_snapshot(&self) -> EntityHolder<T> {
        EntityHolder {
            id: self.entity_id.clone().unwrap_or_default(),
            data_version: self.data_version.unwrap_or(INITIAL_DATA_VERSION),
            created_date: self.created_time,
            modified_date: Some(Utc::now()),
            created_by: None,
            modified_by: self.user.clone(),
            application: self.application.clone(),
            data: self.update.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_holder_starts_at_initial_version() {
        let holder = EntityHolder::new("a", "x".to_string());
        assert_eq!(holder.data_version(), INITIAL_DATA_VERSION);
        assert_eq!(holder.id(), "a");
    }

    #[test]
    fn test_holder_next_increments_version() {
        let holder = EntityHolder::new("a", 1u32);
        let next = holder.next(2);
        assert_eq!(next.data_version, 2);
        assert_eq!(next.created_date, holder.created_date);
        assert_eq!(next.data, 2);
        assert!(next.modified_date.is_some());
    }

    #[test]
    fn test_snapshot_defaults_to_initial_version() {
        let cmd = WriteCommand::update("a", "x".to_string()).with_user("bob");
        let snapshot = cmd.create_snapshot();
        assert_eq!(snapshot.id, "a");
        assert_eq!(snapshot.data_version, INITIAL_DATA_VERSION);
        assert_eq!(snapshot.modified_by.as_deref(), Some("bob"));
    }

    #[test]
    fn test_snapshot_keeps_explicit_version() {
        let cmd = WriteCommand::update("a", 5u8).with_version(3);
        assert_eq!(cmd.create_snapshot().data_version, 3);
    }
}
