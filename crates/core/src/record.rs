//! Records and relational field values.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{TetherError, TetherResult};
use crate::id::Uid;
use crate::schema::Cardinality;

/// Ordered field map of a record.
pub type Fields = Map<String, Value>;

/// A single typed document instance within a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub uid: Uid,
    pub collection: String,
    #[serde(default)]
    pub fields: Fields,
}

impl Record {
    pub fn new(collection: impl Into<String>, uid: impl Into<Uid>, fields: Fields) -> Self {
        Self {
            uid: uid.into(),
            collection: collection.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// UIDs held by a relational field (empty when absent or null).
    pub fn refs(&self, field: &str) -> Vec<Uid> {
        self.fields.get(field).map(ref_uids).unwrap_or_default()
    }

    /// Wire form: the field map with the identity under `uid`.
    pub fn to_json(&self) -> Value {
        let mut out = Map::with_capacity(self.fields.len() + 1);
        out.insert("uid".to_string(), Value::String(self.uid.to_string()));
        for (k, v) in &self.fields {
            out.insert(k.clone(), v.clone());
        }
        Value::Object(out)
    }
}

/// Extract referenced UIDs from a relational value.
///
/// Accepts a string, an array of strings, or null. Other shapes yield nothing;
/// use [`validate_ref_value`] to reject them up front.
pub fn ref_uids(value: &Value) -> Vec<Uid> {
    match value {
        Value::String(s) => vec![Uid::from(s.as_str())],
        Value::Array(items) => items
            .iter()
            .filter_map(|v| v.as_str().map(Uid::from))
            .collect(),
        _ => Vec::new(),
    }
}

/// Check that `value` is a well-formed relational value for `cardinality`.
pub fn validate_ref_value(field: &str, cardinality: Cardinality, value: &Value) -> TetherResult<()> {
    match (cardinality, value) {
        (_, Value::Null) => Ok(()),
        (Cardinality::One, Value::String(s)) if !s.is_empty() => Ok(()),
        (Cardinality::Many, Value::Array(items))
            if items.iter().all(|v| v.as_str().is_some_and(|s| !s.is_empty())) =>
        {
            Ok(())
        }
        (Cardinality::One, other) => Err(TetherError::validation(format!(
            "field `{field}` expects a single uid, got {other}"
        ))),
        (Cardinality::Many, other) => Err(TetherError::validation(format!(
            "field `{field}` expects an array of uids, got {other}"
        ))),
    }
}
