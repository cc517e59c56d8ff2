use std::sync::Arc;

use tracing::{debug, warn};

use tether_core::codec::{decode, decode_untyped, encode, encode_untyped};
use tether_core::filter::UID_KEY;
use tether_core::{Fields, Record, Schema, Uid};

use super::{CacheBackend, CacheError, FieldCodecFailure};

/// Schema-typed side cache: one flat hash per record under `collection:uid`.
///
/// Populated and evicted only by explicit calls. Writes upsert individual
/// fields; fields not present in a write keep their cached value.
pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    schema: Arc<Schema>,
    prefix: Option<String>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, schema: Arc<Schema>) -> Self {
        Self {
            backend,
            schema,
            prefix: None,
        }
    }

    /// Namespace every key as `<prefix>:collection:uid`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into()).filter(|p: &String| !p.is_empty());
        self
    }

    pub fn key(&self, collection: &str, uid: &Uid) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}:{collection}:{uid}"),
            None => format!("{collection}:{uid}"),
        }
    }

    /// Encode and upsert `data`.
    ///
    /// Fields that fail to encode are skipped and reported through
    /// [`CacheError::Codec`]; their valid siblings are still written.
    pub async fn write(&self, collection: &str, uid: &Uid, data: &Fields) -> Result<usize, CacheError> {
        let schema = self
            .schema
            .collection(collection)
            .ok_or_else(|| CacheError::UnknownCollection(collection.to_string()))?;
        let key = self.key(collection, uid);

        let mut entries = Vec::with_capacity(data.len());
        let mut failures = Vec::new();
        for (field, value) in data {
            if field == UID_KEY {
                continue;
            }
            let encoded = match schema.get(field) {
                Some(decl) => encode(decl.field_type, value),
                None => encode_untyped(value),
            };
            match encoded {
                Ok(encoded) => entries.push((field.clone(), encoded)),
                Err(error) => failures.push(FieldCodecFailure {
                    field: field.clone(),
                    error,
                }),
            }
        }

        let written = entries.len();
        self.backend.hash_set_many(&key, entries).await?;
        debug!(key = %key, written, rejected = failures.len(), "cache write");

        if failures.is_empty() {
            Ok(written)
        } else {
            Err(CacheError::Codec { key, failures })
        }
    }

    pub async fn write_record(&self, record: &Record) -> Result<usize, CacheError> {
        self.write(&record.collection, &record.uid, &record.fields).await
    }

    /// Decode the cached hash back into a record.
    ///
    /// Declared fields come first in declaration order, absent ones resolved
    /// from their default. An undecodable field is dropped (or defaulted).
    /// Undeclared cached fields are decoded as JSON, or kept as strings.
    pub async fn read(&self, collection: &str, uid: &Uid) -> Result<Option<Record>, CacheError> {
        let schema = self
            .schema
            .collection(collection)
            .ok_or_else(|| CacheError::UnknownCollection(collection.to_string()))?;
        let key = self.key(collection, uid);

        let mut raw = self.backend.hash_get_all(&key).await?;
        if raw.is_empty() {
            return Ok(None);
        }

        let mut fields = Fields::new();
        for decl in &schema.fields {
            let decoded = match raw.remove(&decl.name) {
                Some(text) => match decode(decl.field_type, &text) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        warn!(key = %key, field = %decl.name, error = %err, "dropping undecodable cache field");
                        None
                    }
                },
                None => None,
            };
            let value = decoded.or_else(|| decl.default.as_ref().map(|d| d.resolve()));
            if let Some(value) = value {
                fields.insert(decl.name.clone(), value);
            }
        }

        let mut extras: Vec<_> = raw.into_iter().collect();
        extras.sort();
        for (field, text) in extras {
            fields.insert(field, decode_untyped(&text));
        }

        Ok(Some(Record::new(collection, uid.clone(), fields)))
    }

    pub async fn evict(&self, collection: &str, uid: &Uid) -> Result<(), CacheError> {
        self.backend.delete(&self.key(collection, uid)).await
    }
}
