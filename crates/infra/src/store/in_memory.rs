use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde_json::Value;

use tether_core::filter::UID_KEY;
use tether_core::{Fields, Filter, MutationPatch, Record, Schema, Uid};

use super::r#trait::{PrimaryStore, QueryOptions, StoreError, UpdateOptions, UpdateOutcome};

/// In-memory document store.
///
/// Intended for tests/dev. Not optimized for performance: every read scans
/// the collection. Records keep insertion order.
#[derive(Debug)]
pub struct InMemoryStore {
    schema: Arc<Schema>,
    collections: RwLock<HashMap<String, Vec<Record>>>,
}

impl InMemoryStore {
    pub fn new(schema: Schema) -> Self {
        Self::with_schema(Arc::new(schema))
    }

    pub fn with_schema(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            collections: RwLock::new(HashMap::new()),
        }
    }

    fn require(&self, collection: &str) -> Result<(), StoreError> {
        if self.schema.collection(collection).is_none() {
            return Err(StoreError::NotFound(format!("collection `{collection}`")));
        }
        Ok(())
    }

    fn poisoned() -> StoreError {
        StoreError::Unavailable("lock poisoned".to_string())
    }

    fn apply_defaults(&self, collection: &str, fields: &mut Fields) {
        let Some(schema) = self.schema.collection(collection) else {
            return;
        };
        for decl in &schema.fields {
            if let Some(default) = &decl.default {
                if !fields.contains_key(&decl.name) {
                    fields.insert(decl.name.clone(), default.resolve());
                }
            }
        }
    }
}

#[async_trait]
impl PrimaryStore for InMemoryStore {
    async fn create(&self, collection: &str, mut data: Fields) -> Result<Record, StoreError> {
        self.require(collection)?;

        let uid = match data.remove(UID_KEY) {
            Some(Value::String(s)) if !s.is_empty() => Uid::from(s),
            Some(Value::Null) | None => Uid::new(),
            Some(other) => {
                return Err(StoreError::Invalid(format!("uid must be a string, got {other}")));
            }
        };
        self.apply_defaults(collection, &mut data);

        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let records = collections.entry(collection.to_string()).or_default();
        if records.iter().any(|r| r.uid == uid) {
            return Err(StoreError::Invalid(format!("duplicate uid `{uid}` in `{collection}`")));
        }

        let record = Record::new(collection, uid, data);
        records.push(record.clone());
        Ok(record)
    }

    async fn get_one(&self, collection: &str, filter: &Filter) -> Result<Option<Record>, StoreError> {
        self.require(collection)?;
        let collections = self.collections.read().map_err(|_| Self::poisoned())?;
        Ok(collections
            .get(collection)
            .and_then(|records| records.iter().find(|r| filter.matches(r)))
            .cloned())
    }

    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, StoreError> {
        self.require(collection)?;
        let mut matched: Vec<Record> = {
            let collections = self.collections.read().map_err(|_| Self::poisoned())?;
            collections
                .get(collection)
                .map(|records| records.iter().filter(|r| filter.matches(r)).cloned().collect())
                .unwrap_or_default()
        };
        options.apply(&mut matched);
        Ok(matched)
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &MutationPatch,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        self.require(collection)?;
        if patch.touched_fields().iter().any(|f| f == UID_KEY) {
            return Err(StoreError::Invalid("uid cannot be updated".to_string()));
        }

        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let mut updated = Vec::new();
        if let Some(records) = collections.get_mut(collection) {
            for record in records.iter_mut().filter(|r| filter.matches(r)) {
                patch.apply_to(&mut record.fields);
                updated.push(record.clone());
                if !options.many {
                    break;
                }
            }
        }

        Ok(match (options.return_records, options.many) {
            (false, _) => UpdateOutcome::Acknowledged {
                matched: updated.len(),
            },
            (true, true) => UpdateOutcome::Records(updated),
            (true, false) => match updated.pop() {
                Some(record) => UpdateOutcome::Record(record),
                None => UpdateOutcome::Acknowledged { matched: 0 },
            },
        })
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError> {
        self.require(collection)?;
        let mut collections = self.collections.write().map_err(|_| Self::poisoned())?;
        let Some(records) = collections.get_mut(collection) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|r| !filter.matches(r));
        Ok(before - records.len())
    }

    fn schema(&self) -> Arc<Schema> {
        self.schema.clone()
    }
}
