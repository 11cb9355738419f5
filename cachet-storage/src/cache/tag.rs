//! Cache tags.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;

/// Secondary index key grouping cache entries.
///
/// A tag is a name plus an ordered list of discriminator values. Two tags are
/// equal when their canonical text is equal: `name[v1,v2,]`, each value
/// rendered with `Display` and trimmed. A tag without a values list renders
/// as just `name`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheTag(Arc<str>);

impl CacheTag {
    pub fn new<I>(name: &str, values: I) -> Self
    where
        I: IntoIterator,
        I::Item: fmt::Display,
    {
        let mut text = String::from(name);
        text.push('[');
        for value in values {
            text.push_str(value.to_string().trim());
            text.push(',');
        }
        text.push(']');
        Self(text.into())
    }

    /// A tag with no discriminator values.
    pub fn named(name: &str) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for CacheTag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for CacheTag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|text| Self(text.into()))
    }
}

impl fmt::Debug for CacheTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheTag({})", self.0)
    }
}
