use std::cmp::Ordering;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use tether_core::{Fields, Filter, MutationPatch, Record, Schema, TetherError};

/// Sort direction for one sort key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    #[serde(default)]
    pub order: SortOrder,
}

impl SortKey {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Asc,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            order: SortOrder::Desc,
        }
    }
}

/// Read options for `get_many` and query subscriptions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    #[serde(default)]
    pub sort: Vec<SortKey>,
    #[serde(default)]
    pub skip: Option<usize>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Read-time population depth (0 = UIDs only).
    #[serde(default)]
    pub populate: usize,
}

impl QueryOptions {
    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort.push(key);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_populate(mut self, depth: usize) -> Self {
        self.populate = depth;
        self
    }

    /// Sort, skip and limit `records` in place.
    pub fn apply(&self, records: &mut Vec<Record>) {
        if !self.sort.is_empty() {
            records.sort_by(|a, b| {
                for key in &self.sort {
                    let ord = compare_values(field_or_uid(a, &key.field), field_or_uid(b, &key.field));
                    let ord = match key.order {
                        SortOrder::Asc => ord,
                        SortOrder::Desc => ord.reverse(),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
        }

        let skip = self.skip.unwrap_or(0).min(records.len());
        records.drain(..skip);
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
    }
}

fn field_or_uid(record: &Record, field: &str) -> Option<Value> {
    if field == tether_core::filter::UID_KEY {
        return Some(Value::String(record.uid.to_string()));
    }
    record.get(field).cloned()
}

/// Total order over optional JSON values: missing < null < bool < number < string < other.
fn compare_values(a: Option<Value>, b: Option<Value>) -> Ordering {
    fn rank(v: &Option<Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (&a, &b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(x), Some(y)) if rank(&a) == 5 && rank(&b) == 5 => x.to_string().cmp(&y.to_string()),
        _ => rank(&a).cmp(&rank(&b)),
    }
}

/// Options for `update`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UpdateOptions {
    /// Update every matching record instead of the first one.
    pub many: bool,
    /// Return the updated records instead of a bare acknowledgement.
    pub return_records: bool,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            many: false,
            return_records: true,
        }
    }
}

impl UpdateOptions {
    pub fn many() -> Self {
        Self {
            many: true,
            ..Self::default()
        }
    }
}

/// Result of `update`: the updated record(s) or a match count.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Record(Record),
    Records(Vec<Record>),
    Acknowledged { matched: usize },
}

impl UpdateOutcome {
    pub fn matched(&self) -> usize {
        match self {
            UpdateOutcome::Record(_) => 1,
            UpdateOutcome::Records(records) => records.len(),
            UpdateOutcome::Acknowledged { matched } => *matched,
        }
    }

    /// Updated records, when the store returned them.
    pub fn into_records(self) -> Option<Vec<Record>> {
        match self {
            UpdateOutcome::Record(record) => Some(vec![record]),
            UpdateOutcome::Records(records) => Some(records),
            UpdateOutcome::Acknowledged { .. } => None,
        }
    }
}

/// Primary store operation error.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid write: {0}")]
    Invalid(String),

    /// Transient backend failure; worth retrying.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<StoreError> for TetherError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => TetherError::NotFound(msg),
            StoreError::Invalid(msg) => TetherError::Validation(msg),
            StoreError::Unavailable(msg) => TetherError::Store(msg),
        }
    }
}

/// The primary document store this engine wraps.
///
/// The engine never issues raw storage queries: every read and write goes
/// through this boundary. Implementations own query execution and the schema.
///
/// ## Semantics
///
/// - `create` assigns a fresh UID unless `data` carries a string `uid`
/// - `get_many` returns records in insertion order before `options` apply
/// - `update` applies `patch` to the first match (or every match with
///   `UpdateOptions::many`); zero matches is not an error
/// - `delete` removes every match and returns how many were removed
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn create(&self, collection: &str, data: Fields) -> Result<Record, StoreError>;

    async fn get_one(&self, collection: &str, filter: &Filter) -> Result<Option<Record>, StoreError>;

    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, StoreError>;

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &MutationPatch,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome, StoreError>;

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError>;

    /// Schema introspection.
    fn schema(&self) -> Arc<Schema>;
}

#[async_trait]
impl<S> PrimaryStore for Arc<S>
where
    S: PrimaryStore + ?Sized,
{
    async fn create(&self, collection: &str, data: Fields) -> Result<Record, StoreError> {
        (**self).create(collection, data).await
    }

    async fn get_one(&self, collection: &str, filter: &Filter) -> Result<Option<Record>, StoreError> {
        (**self).get_one(collection, filter).await
    }

    async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> Result<Vec<Record>, StoreError> {
        (**self).get_many(collection, filter, options).await
    }

    async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &MutationPatch,
        options: &UpdateOptions,
    ) -> Result<UpdateOutcome, StoreError> {
        (**self).update(collection, filter, patch, options).await
    }

    async fn delete(&self, collection: &str, filter: &Filter) -> Result<usize, StoreError> {
        (**self).delete(collection, filter).await
    }

    fn schema(&self) -> Arc<Schema> {
        (**self).schema()
    }
}
