//! Schema metadata: collections, field declarations and link configuration.
//!
//! The primary store owns the schema; the engine only reads it (introspection)
//! to find relational fields, resolve cache defaults and validate input.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{TetherError, TetherResult};

/// Declared type of a field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    /// Record identity (string form).
    Id,
    String,
    Number,
    Boolean,
    /// Date/time. Decodes to epoch milliseconds.
    Date,
    Array,
    Object,
}

impl FieldType {
    /// Cardinality a relational field of this type has on its own side.
    pub fn cardinality(&self) -> Cardinality {
        match self {
            FieldType::Array => Cardinality::Many,
            _ => Cardinality::One,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    One,
    Many,
}

/// Declares that a field mirrors `related_field` on the referenced `collection`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkConfig {
    /// Referenced collection.
    pub collection: String,
    /// Field on the referenced collection that points back here.
    pub related_field: String,
    /// This side's cardinality.
    pub cardinality: Cardinality,
}

impl LinkConfig {
    pub fn one(collection: impl Into<String>, related_field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            related_field: related_field.into(),
            cardinality: Cardinality::One,
        }
    }

    pub fn many(collection: impl Into<String>, related_field: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            related_field: related_field.into(),
            cardinality: Cardinality::Many,
        }
    }
}

/// Built-in zero-argument default producers that can be named in a schema document.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuiltinDefault {
    /// Current time, epoch milliseconds.
    Now,
    /// Fresh UUIDv7 string.
    Uuid,
    EmptyArray,
    EmptyObject,
}

/// Programmatic zero-argument default producer.
#[derive(Clone)]
pub struct DefaultProducer(Arc<dyn Fn() -> Value + Send + Sync>);

impl DefaultProducer {
    pub fn new(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn produce(&self) -> Value {
        (self.0)()
    }
}

impl core::fmt::Debug for DefaultProducer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DefaultProducer(..)")
    }
}

/// Default applied when a field is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldDefault {
    Value(Value),
    Builtin(BuiltinDefault),
    #[serde(skip)]
    Producer(DefaultProducer),
}

impl FieldDefault {
    pub fn producer(f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        Self::Producer(DefaultProducer::new(f))
    }

    /// Resolve the default to a concrete value.
    pub fn resolve(&self) -> Value {
        match self {
            FieldDefault::Value(v) => v.clone(),
            FieldDefault::Builtin(BuiltinDefault::Now) => Value::from(Utc::now().timestamp_millis()),
            FieldDefault::Builtin(BuiltinDefault::Uuid) => Value::String(Uuid::now_v7().to_string()),
            FieldDefault::Builtin(BuiltinDefault::EmptyArray) => Value::Array(Vec::new()),
            FieldDefault::Builtin(BuiltinDefault::EmptyObject) => Value::Object(Default::default()),
            FieldDefault::Producer(p) => p.produce(),
        }
    }
}

/// Declaration of a single field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDecl {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<LinkConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<FieldDefault>,
}

impl FieldDecl {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            link: None,
            default: None,
        }
    }

    /// Single reference to `collection`, mirrored by `related_field` over there.
    pub fn link_one(
        name: impl Into<String>,
        collection: impl Into<String>,
        related_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Id,
            link: Some(LinkConfig::one(collection, related_field)),
            default: None,
        }
    }

    /// Set of references to `collection`, mirrored by `related_field` over there.
    pub fn link_many(
        name: impl Into<String>,
        collection: impl Into<String>,
        related_field: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            field_type: FieldType::Array,
            link: Some(LinkConfig::many(collection, related_field)),
            default: None,
        }
    }

    pub fn with_default(mut self, default: FieldDefault) -> Self {
        self.default = Some(default);
        self
    }

    pub fn is_relational(&self) -> bool {
        self.link.is_some()
    }
}

/// Ordered field declarations of one collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: String,
    pub fields: Vec<FieldDecl>,
    /// Distinguished status-transition field (publishes value-scoped topics).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_field: Option<String>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
            status_field: None,
        }
    }

    pub fn field(mut self, decl: FieldDecl) -> Self {
        self.fields.push(decl);
        self
    }

    pub fn with_status_field(mut self, field: impl Into<String>) -> Self {
        self.status_field = Some(field.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&FieldDecl> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn relational_fields(&self) -> impl Iterator<Item = &FieldDecl> {
        self.fields.iter().filter(|f| f.is_relational())
    }
}

#[derive(Deserialize)]
struct SchemaDocument {
    collections: Vec<CollectionSchema>,
}

#[derive(Serialize)]
struct SchemaDocumentRef<'a> {
    collections: Vec<&'a CollectionSchema>,
}

/// All collection schemas known to the primary store.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "SchemaDocument")]
pub struct Schema {
    collections: BTreeMap<String, CollectionSchema>,
}

impl TryFrom<SchemaDocument> for Schema {
    type Error = TetherError;

    fn try_from(doc: SchemaDocument) -> Result<Self, Self::Error> {
        Schema::from_collections(doc.collections)
    }
}

impl Serialize for Schema {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SchemaDocumentRef {
            collections: self.collections.values().collect(),
        }
        .serialize(serializer)
    }
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_collections(
        collections: impl IntoIterator<Item = CollectionSchema>,
    ) -> TetherResult<Self> {
        let mut map = BTreeMap::new();
        for c in collections {
            if map.contains_key(&c.name) {
                return Err(TetherError::validation(format!(
                    "duplicate collection `{}`",
                    c.name
                )));
            }
            map.insert(c.name.clone(), c);
        }
        Ok(Self { collections: map })
    }

    pub fn from_json_str(s: &str) -> TetherResult<Self> {
        serde_json::from_str(s).map_err(|e| TetherError::validation(format!("schema: {e}")))
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Like [`Schema::collection`] but a missing collection is a `NotFound` failure.
    pub fn require(&self, name: &str) -> TetherResult<&CollectionSchema> {
        self.collection(name)
            .ok_or_else(|| TetherError::not_found(format!("collection `{name}`")))
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionSchema> {
        self.collections.values()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn schema_document_parses_links_and_defaults() {
        let schema = Schema::from_json_str(
            r#"{
                "collections": [
                    {
                        "name": "users",
                        "statusField": "state",
                        "fields": [
                            { "name": "firstName", "type": "string" },
                            { "name": "isEmailConfirmed", "type": "boolean", "default": { "value": false } },
                            { "name": "createdAt", "type": "date", "default": { "builtin": "now" } },
                            { "name": "auth", "type": "id",
                              "link": { "collection": "auth_buckets", "relatedField": "user", "cardinality": "one" } }
                        ]
                    }
                ]
            }"#,
        )
        .unwrap();

        let users = schema.require("users").unwrap();
        assert_eq!(users.status_field.as_deref(), Some("state"));
        assert_eq!(users.relational_fields().count(), 1);

        let auth = users.get("auth").unwrap();
        assert_eq!(
            auth.link,
            Some(LinkConfig::one("auth_buckets", "user"))
        );

        let confirmed = users.get("isEmailConfirmed").unwrap();
        assert_eq!(confirmed.default.as_ref().unwrap().resolve(), json!(false));
        assert!(users.get("createdAt").unwrap().default.as_ref().unwrap().resolve().is_i64());
    }

    #[test]
    fn duplicate_collections_are_rejected() {
        let err = Schema::from_collections(vec![
            CollectionSchema::new("users"),
            CollectionSchema::new("users"),
        ])
        .unwrap_err();
        assert!(matches!(err, TetherError::Validation(_)));
    }

    #[test]
    fn missing_collection_is_not_found() {
        let err = Schema::new().require("ghosts").unwrap_err();
        assert!(matches!(err, TetherError::NotFound(_)));
    }

    #[test]
    fn producer_defaults_are_invoked_on_resolve() {
        let decl = FieldDecl::new("tags", FieldType::Array)
            .with_default(FieldDefault::producer(|| json!(["new"])));
        assert_eq!(decl.default.unwrap().resolve(), json!(["new"]));
    }
}
