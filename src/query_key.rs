// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Structural cache identity.
//!
//! A [`QueryKey`] is an ordered tuple `(resource, params...)` of JSON values.
//! Equality and hashing go through a canonical JSON rendering with object
//! fields sorted, so two logically equal requests always address the same
//! entry no matter how their parameters were assembled.
//!
//! ```
//! use query_sync::{query_key, QueryKey};
//! use serde_json::json;
//!
//! let a = query_key!["tasks", {"owner": "u1", "done": false}];
//! let b = QueryKey::new("tasks").with(json!({"done": false, "owner": "u1"}));
//! assert_eq!(a, b);
//! assert!(a.starts_with(&query_key!["tasks"]));
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::QueryError;

#[derive(Clone)]
pub struct QueryKey {
    segments: Arc<[Value]>,
    canonical: Arc<str>,
}

impl QueryKey {
    /// Key with a single resource segment, e.g. `["tasks"]`.
    pub fn new(resource: impl Into<String>) -> Self {
        Self::from_segments(vec![Value::String(resource.into())])
    }

    pub fn from_segments(segments: Vec<Value>) -> Self {
        let segments: Vec<Value> = segments.iter().map(canonicalize).collect();
        let canonical = Value::Array(segments.clone()).to_string();
        Self {
            segments: segments.into(),
            canonical: canonical.into(),
        }
    }

    /// Append one parameter segment.
    #[must_use]
    pub fn with(self, segment: impl Into<Value>) -> Self {
        let mut segments = self.segments.to_vec();
        segments.push(segment.into());
        Self::from_segments(segments)
    }

    /// Append any serializable parameter (structs, maps...).
    pub fn with_serialized(self, segment: &impl Serialize) -> Result<Self, QueryError> {
        let value = serde_json::to_value(segment)
            .map_err(|e| QueryError::Malformed(format!("query key segment: {e}")))?;
        Ok(self.with(value))
    }

    #[must_use]
    pub fn segments(&self) -> &[Value] {
        &self.segments
    }

    /// First segment when it is a string (the resource name).
    #[must_use]
    pub fn resource(&self) -> Option<&str> {
        self.segments.first().and_then(Value::as_str)
    }

    /// Canonical JSON rendering, the identity used for equality.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// `["tasks"]` is a prefix of `["tasks", "u1"]` and of itself.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix
                .segments
                .iter()
                .zip(self.segments.iter())
                .all(|(p, s)| p == s)
    }
}

/// Rebuild objects with sorted fields, recursively.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut fields: Vec<(&String, &Value)> = map.iter().collect();
            fields.sort_by(|a, b| a.0.cmp(b.0));
            let sorted: Map<String, Value> = fields
                .into_iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect();
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueryKey({})", self.canonical)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl Serialize for QueryKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.segments.serialize(serializer)
    }
}

impl From<&str> for QueryKey {
    fn from(resource: &str) -> Self {
        Self::new(resource)
    }
}

/// Build a [`QueryKey`] from a list of `serde_json::json!`-compatible segments.
///
/// ```
/// use query_sync::query_key;
///
/// let user_id = "u1";
/// let key = query_key!["tasks", user_id];
/// assert_eq!(key.as_str(), r#"["tasks","u1"]"#);
/// ```
#[macro_export]
macro_rules! query_key {
    ($($segment:tt),+ $(,)?) => {
        $crate::QueryKey::from_segments(vec![$($crate::__private::json!($segment)),+])
    };
}
