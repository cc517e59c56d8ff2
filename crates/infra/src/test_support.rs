//! Fixtures shared by unit and integration tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{Value, json};

use tether_core::{
    BuiltinDefault, CollectionSchema, FieldDecl, FieldDefault, FieldType, Fields, Filter,
    MutationPatch, Record, Schema,
};

use crate::store::{InMemoryStore, PrimaryStore, QueryOptions, StoreError, UpdateOptions, UpdateOutcome};

/// users <-> auth_buckets (one/one), users <-> groups (many/many), posts unlinked.
pub fn schema() -> Schema {
    Schema::new()
        .with_collection(
            CollectionSchema::new("users")
                .field(FieldDecl::new("firstName", FieldType::String))
                .field(FieldDecl::new("lastName", FieldType::String))
                .field(
                    FieldDecl::new("isEmailConfirmed", FieldType::Boolean)
                        .with_default(FieldDefault::Value(json!(false))),
                )
                .field(FieldDecl::new("loginCount", FieldType::Number).with_default(FieldDefault::Value(json!(0))))
                .field(FieldDecl::new("status", FieldType::String))
                .field(FieldDecl::link_one("auth", "auth_buckets", "user"))
                .field(
                    FieldDecl::link_many("groups", "groups", "members")
                        .with_default(FieldDefault::Builtin(BuiltinDefault::EmptyArray)),
                )
                .with_status_field("status"),
        )
        .with_collection(
            CollectionSchema::new("auth_buckets")
                .field(FieldDecl::new("provider", FieldType::String))
                .field(FieldDecl::link_one("user", "users", "auth")),
        )
        .with_collection(
            CollectionSchema::new("groups")
                .field(FieldDecl::new("name", FieldType::String))
                .field(FieldDecl::link_many("members", "users", "groups")),
        )
        .with_collection(
            CollectionSchema::new("posts")
                .field(FieldDecl::new("title", FieldType::String))
                .field(FieldDecl::new("publishedAt", FieldType::Date)),
        )
}

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        other => panic!("expected an object, got {other}"),
    }
}

/// Store wrapper whose updates on selected collections fail with a transient error.
pub struct FlakyStore {
    inner: InMemoryStore,
    remaining_failures: Mutex<HashMap<String, u32>>,
    update_calls: Mutex<HashMap<String, u32>>,
}

impl FlakyStore {
    pub fn new(schema: Schema) -> Self {
        Self {
            inner: InMemoryStore::new(schema),
            remaining_failures: Mutex::new(HashMap::new()),
            update_calls: Mutex::new(HashMap::new()),
        }
    }

    /// Fail the next `times` updates on `collection`.
    pub fn fail_updates(&self, collection: &str, times: u32) {
        self.remaining_failures
            .lock()
            .unwrap()
            .insert(collection.to_string(), times);
    }

    pub fn update_calls(&self, collection: &str) -> u32 {
        self.update_calls.lock().unwrap().get(collection).copied().unwrap_or(0)
    }
}

#[async_trait]
impl PrimaryStore for FlakyStore {
    async fn create(&self, collection: &str, data: Fields) -> Result<Record, StoreError> {
        self.inner.create(collection, data).await
    }

    async fn get_one(&self, collection: &str, filter: &Filter) -> Result<Option<Record>, StoreError> {
        self.inner.get_one(collection, filter).await
    }

    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.get_many(collection, filter, options).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &MutationPatch,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        *self
            .update_calls
            .lock()
            .unwrap()
            .entry(collection.to_string())
            .or_default() += 1;

        let fail = {
            let mut remaining = self.remaining_failures.lock().unwrap();
            match remaining.get_mut(collection) {
                Some(n) if *n > 0 => {
                    *n -= 1;
                    true
                }
                _ => false,
            }
        };
        if fail {
            return Err(StoreError::Unavailable(format!("{collection} offline")));
        }
        self.inner.update(collection, filter, patch, options).await
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.inner.delete(collection, filter).await
    }

    fn schema(&self) -> Arc<Schema> {
        self.inner.schema()
    }
}
