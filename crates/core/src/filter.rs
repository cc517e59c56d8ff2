//! Equality filters and their canonical serialization.
//!
//! Canonical text is what makes filter-scoped topics work: two filters with the
//! same constraints always serialize identically (keys sorted at every depth),
//! and distinct constraints never do.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::id::Uid;
use crate::record::Record;

/// Reserved filter key matching the record identity.
pub const UID_KEY: &str = "uid";

/// Conjunction of field equality constraints.
///
/// For array-valued record fields a scalar constraint means membership.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Filter(BTreeMap<String, Value>);

impl Filter {
    /// Matches every record.
    pub fn all() -> Self {
        Self::default()
    }

    pub fn uid(uid: &Uid) -> Self {
        Self::all().and(UID_KEY, Value::String(uid.to_string()))
    }

    pub fn and(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Narrow this filter to a single record identity.
    pub fn with_uid(&self, uid: &Uid) -> Self {
        self.clone().and(UID_KEY, Value::String(uid.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// The identity this filter pins, if any.
    pub fn pinned_uid(&self) -> Option<Uid> {
        self.0.get(UID_KEY).and_then(Value::as_str).map(Uid::from)
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.0.iter().all(|(field, expected)| {
            if field == UID_KEY {
                return expected.as_str() == Some(record.uid.as_str());
            }
            match (record.fields.get(field), expected) {
                (None, Value::Null) => true,
                (None, _) => false,
                (Some(actual @ Value::Array(_)), Value::Array(_)) => actual == expected,
                (Some(Value::Array(items)), scalar) => items.contains(scalar),
                (Some(actual), _) => actual == expected,
            }
        })
    }

    /// Key-sorted compact JSON of the constraint object.
    pub fn canonical(&self) -> String {
        let obj: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), canonicalize(v)))
            .collect();
        Value::Object(obj).to_string()
    }
}

impl From<Map<String, Value>> for Filter {
    fn from(map: Map<String, Value>) -> Self {
        Self(map.into_iter().collect())
    }
}

/// Rebuild `value` with object keys sorted at every depth.
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::with_capacity(map.len());
            for k in keys {
                out.insert(k.clone(), canonicalize(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Canonical compact JSON text of any value.
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}
