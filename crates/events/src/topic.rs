//! Topic naming.
//!
//! A topic is an exact-match string key: `<kind>:<collection>` optionally
//! followed by `:<canonical filter>`. There is no wildcard matching; filter
//! granularity comes from embedding the canonical filter text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use tether_core::{Filter, Operation, Uid, canonical_json};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Arbitrary topic string.
    pub fn raw(topic: impl Into<String>) -> Self {
        Self(topic.into())
    }

    /// `create:<collection>`, `update:<collection>` or `delete:<collection>`.
    pub fn collection(operation: Operation, collection: &str) -> Self {
        Self(format!("{}:{}", operation.as_str(), collection))
    }

    pub fn created(collection: &str) -> Self {
        Self::collection(Operation::Create, collection)
    }

    pub fn updated(collection: &str) -> Self {
        Self::collection(Operation::Update, collection)
    }

    pub fn deleted(collection: &str) -> Self {
        Self::collection(Operation::Delete, collection)
    }

    /// `<operation>:<collection>:<canonical filter>`.
    pub fn filtered(operation: Operation, collection: &str, filter: &Filter) -> Self {
        Self(format!(
            "{}:{}:{}",
            operation.as_str(),
            collection,
            filter.canonical()
        ))
    }

    /// Filter-scoped topic for a single record identity.
    pub fn record(operation: Operation, collection: &str, uid: &Uid) -> Self {
        Self::filtered(operation, collection, &Filter::uid(uid))
    }

    /// `status:<collection>:{"<field>":<value>}`.
    pub fn status(collection: &str, field: &str, value: &Value) -> Self {
        let mut scope = serde_json::Map::new();
        scope.insert(field.to_string(), value.clone());
        Self(format!(
            "status:{}:{}",
            collection,
            canonical_json(&Value::Object(scope))
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}
