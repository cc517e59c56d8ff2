//! Lifecycle hooks around primary-store mutations.
//!
//! [`LinkedStore`] is the write path callers use instead of the raw store:
//!
//! 1. validate input against the schema (no side effects on failure)
//! 2. pre-hook: capture prior records for update/delete
//! 3. primary write
//! 4. post-hook: run the [`Propagator`], then publish topics
//!
//! Topics published per mutated record:
//!
//! - create: `create:<c>`
//! - update: `update:<c>` and `update:<c>:{"uid":…}`
//! - delete: `delete:<c>` and `delete:<c>:{"uid":…}`
//! - `status:<c>:{"<field>":<value>}` when the status field is set (non-null) on create or changes on update
//!
//! Every opposite record touched by propagation is announced with `update:<opposite>`
//! and its per-record update topic.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use tether_core::record::validate_ref_value;
use tether_core::{
    Fields, Filter, MutationEvent, MutationPatch, Operation, Record, Schema, TetherError,
    TetherResult,
};
use tether_events::{EventBus, Topic};

use crate::relations::{PropagationReport, Propagator};
use crate::store::{PrimaryStore, QueryOptions, UpdateOptions};

/// Result of a mutation whose primary write succeeded.
///
/// Propagation failures do not undo `value`; they are reported alongside it.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation<T> {
    pub value: T,
    pub propagation: PropagationReport,
}

impl<T> Mutation<T> {
    /// Treat a propagation failure as an error.
    pub fn into_result(self) -> TetherResult<T> {
        match self.propagation.failure {
            Some(failure) => Err(TetherError::Propagation(failure)),
            None => Ok(self.value),
        }
    }
}

pub struct LinkedStore {
    store: Arc<dyn PrimaryStore>,
    propagator: Arc<Propagator>,
    bus: Arc<dyn EventBus<MutationEvent>>,
}

impl LinkedStore {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        propagator: Arc<Propagator>,
        bus: Arc<dyn EventBus<MutationEvent>>,
    ) -> Self {
        Self {
            store,
            propagator,
            bus,
        }
    }

    /// The wrapped store, for reads.
    pub fn inner(&self) -> &Arc<dyn PrimaryStore> {
        &self.store
    }

    pub fn schema(&self) -> Arc<Schema> {
        self.store.schema()
    }

    pub async fn get_one(&self, collection: &str, filter: &Filter) -> TetherResult<Option<Record>> {
        Ok(self.store.get_one(collection, filter).await?)
    }

    pub async fn get_many(
        &self,
        collection: &str,
        filter: &Filter,
        options: &QueryOptions,
    ) -> TetherResult<Vec<Record>> {
        Ok(self.store.get_many(collection, filter, options).await?)
    }

    pub async fn create(&self, collection: &str, data: Fields) -> TetherResult<Mutation<Record>> {
        self.validate_fields(collection, &data)?;

        let record = self.store.create(collection, data).await?;
        debug!(collection, uid = %record.uid, "created");

        let propagation = self
            .propagator
            .execute(self.propagator.plan_create(&record))
            .await;

        self.publish(&Topic::created(collection), MutationEvent::created(record.clone()))
            .await;
        if let Some((field, value)) = self.status_of(&record) {
            self.publish(&Topic::status(collection, &field, &value), MutationEvent::created(record.clone()))
                .await;
        }
        announce_touched(self.bus.as_ref(), &propagation).await;

        Ok(Mutation {
            value: record,
            propagation,
        })
    }

    /// Apply `patch` to the first match (or every match with `UpdateOptions::many`).
    ///
    /// A single-record update that matches nothing is a `NotFound` failure.
    pub async fn update(
        &self,
        collection: &str,
        filter: &Filter,
        patch: &MutationPatch,
        options: &UpdateOptions,
    ) -> TetherResult<Mutation<Vec<Record>>> {
        self.validate_patch(collection, patch)?;

        let mut before = self
            .store
            .get_many(collection, filter, &QueryOptions::default())
            .await?;
        if !options.many {
            before.truncate(1);
        }
        if before.is_empty() {
            if options.many {
                return Ok(Mutation {
                    value: Vec::new(),
                    propagation: PropagationReport::default(),
                });
            }
            return Err(TetherError::not_found(format!("{collection} matching {}", filter.canonical())));
        }

        let outcome = self.store.update(collection, filter, patch, options).await?;
        let after = match outcome.into_records() {
            Some(records) => records,
            None => self.refetch(collection, &before).await?,
        };

        let mut plan = Vec::new();
        for record in &after {
            if let Some(prior) = before.iter().find(|b| b.uid == record.uid) {
                plan.extend(self.propagator.plan_update(prior, record, patch));
            }
        }
        let propagation = self.propagator.execute(plan).await;

        let changed = patch.touched_fields();
        for record in &after {
            let prior = before.iter().find(|b| b.uid == record.uid).cloned();
            let status_change = self.status_of(record).filter(|(field, value)| {
                prior.as_ref().and_then(|p| p.get(field)) != Some(value)
            });
            let event = MutationEvent::updated(prior, record.clone(), changed.clone());

            self.publish(&Topic::updated(collection), event.clone()).await;
            self.publish(&Topic::record(Operation::Update, collection, &record.uid), event.clone())
                .await;
            if let Some((field, value)) = status_change {
                self.publish(&Topic::status(collection, &field, &value), event).await;
            }
        }
        announce_touched(self.bus.as_ref(), &propagation).await;

        Ok(Mutation {
            value: after,
            propagation,
        })
    }

    /// Delete every match; returns how many records were removed.
    pub async fn delete(&self, collection: &str, filter: &Filter) -> TetherResult<Mutation<usize>> {
        self.schema().require(collection)?;

        let before = self
            .store
            .get_many(collection, filter, &QueryOptions::default())
            .await?;
        if before.is_empty() {
            return Ok(Mutation {
                value: 0,
                propagation: PropagationReport::default(),
            });
        }

        let removed = self.store.delete(collection, filter).await?;
        debug!(collection, removed, "deleted");

        let plan = before
            .iter()
            .flat_map(|record| self.propagator.plan_delete(record))
            .collect();
        let propagation = self.propagator.execute(plan).await;

        for record in before {
            let topic = Topic::record(Operation::Delete, collection, &record.uid);
            let event = MutationEvent::deleted(record);
            self.publish(&Topic::deleted(collection), event.clone()).await;
            self.publish(&topic, event).await;
        }
        announce_touched(self.bus.as_ref(), &propagation).await;

        Ok(Mutation {
            value: removed,
            propagation,
        })
    }

    async fn refetch(&self, collection: &str, before: &[Record]) -> TetherResult<Vec<Record>> {
        let mut after = Vec::with_capacity(before.len());
        for prior in before {
            if let Some(record) = self.store.get_one(collection, &Filter::uid(&prior.uid)).await? {
                after.push(record);
            }
        }
        Ok(after)
    }

    async fn publish(&self, topic: &Topic, event: MutationEvent) {
        publish(self.bus.as_ref(), topic, event).await;
    }

    fn status_of(&self, record: &Record) -> Option<(String, Value)> {
        let schema = self.schema();
        let field = schema.collection(&record.collection)?.status_field.clone()?;
        let value = record.get(&field).filter(|v| !v.is_null())?.clone();
        Some((field, value))
    }

    fn validate_fields(&self, collection: &str, data: &Fields) -> TetherResult<()> {
        self.schema().require(collection)?;
        for edge in self.propagator.graph().edges(collection) {
            if let Some(value) = data.get(&edge.field) {
                validate_ref_value(&edge.field, edge.cardinality, value)?;
            }
        }
        Ok(())
    }

    fn validate_patch(&self, collection: &str, patch: &MutationPatch) -> TetherResult<()> {
        match patch {
            MutationPatch::Overwrite { fields } => self.validate_fields(collection, fields),
            MutationPatch::SetOp { field, add, remove } => {
                let schema = self.schema();
                let declared = schema.require(collection)?;
                if let Some(decl) = declared.get(field) {
                    if decl.field_type != tether_core::FieldType::Array {
                        return Err(TetherError::validation(format!(
                            "set operation on non-array field `{collection}.{field}`"
                        )));
                    }
                }
                if let Some(edge) = self.propagator.graph().edge(collection, field) {
                    for value in add.iter().chain(remove) {
                        validate_ref_value(field, edge.cardinality, &Value::Array(vec![value.clone()]))?;
                    }
                }
                Ok(())
            }
        }
    }
}

/// Announce every opposite record touched by propagation with `update:<opposite>`
/// and its per-record update topic.
pub(crate) async fn announce_touched(
    bus: &dyn EventBus<MutationEvent>,
    propagation: &PropagationReport,
) {
    for touched in &propagation.touched {
        let record = &touched.record;
        let event = MutationEvent::updated(None, record.clone(), vec![touched.field.clone()]);
        publish(bus, &Topic::updated(&record.collection), event.clone()).await;
        publish(
            bus,
            &Topic::record(Operation::Update, &record.collection, &record.uid),
            event,
        )
        .await;
    }
}

async fn publish(bus: &dyn EventBus<MutationEvent>, topic: &Topic, event: MutationEvent) {
    let report = bus.publish(topic, event).await;
    if report.failed > 0 {
        warn!(topic = %topic, failed = report.failed, "some listeners failed");
    }
}
