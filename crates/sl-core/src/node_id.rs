//! Strongly-typed node identifier.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use std::ops::Deref;

/// Fully-qualified, case-normalised identifier of a graph node.
///
/// Tables and functions carry `schema.name` (or `db.schema.name`) ids; tests
/// carry their bare declared name. Construction through [`NodeId::normalized`]
/// lower-cases every part and strips identifier quotes so that `"Raw"."Orders"`
/// and `raw.orders` compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NodeId::normalized(&s).ok_or_else(|| serde::de::Error::custom("NodeId must not be empty"))
    }
}

impl NodeId {
    /// Create a `NodeId` from an already-normalised string.
    ///
    /// Panics if the name is empty. Prefer [`normalized`](Self::normalized)
    /// for user input.
    pub fn new(name: impl Into<String>) -> Self {
        let s = name.into();
        assert!(!s.is_empty(), "NodeId must not be empty");
        Self(s)
    }

    /// Normalise a raw reference into a `NodeId`.
    ///
    /// Returns `None` when nothing remains after trimming.
    pub fn normalized(raw: &str) -> Option<Self> {
        let parts: Vec<String> = raw
            .split('.')
            .map(|p| p.trim().trim_matches('"').trim_matches('`').to_lowercase())
            .collect();
        if parts.iter().any(|p| p.is_empty()) {
            return None;
        }
        Some(Self(parts.join(".")))
    }

    /// Whether the id carries a schema (or catalog) qualifier.
    pub fn is_qualified(&self) -> bool {
        self.0.contains('.')
    }

    /// The unqualified trailing part of the id.
    pub fn short_name(&self) -> &str {
        self.0.rsplit('.').next().unwrap_or(&self.0)
    }

    /// Return the underlying id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the wrapper and return the inner `String`.
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Deref for NodeId {
    type Target = str;
    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for NodeId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for NodeId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}
