//! Consistency propagator.
//!
//! Turns one mutation into the opposite-side writes that keep linked fields
//! mirrored, then issues them concurrently against the primary store.
//!
//! ## Semantics
//!
//! - **Create**: every present relational value links this record on the
//!   opposite side (set-union for array fields, assignment for scalars).
//! - **Update**: overwrites are diffed against the prior value; set operations
//!   are translated element-wise. Only changed elements produce writes.
//! - **Delete**: every prior relational value is unlinked.
//! - **Best effort**: a failed step never rolls back its siblings or the
//!   primary write. Failures are aggregated into a [`PropagationFailure`].
//! - **One hop**: writes go straight to the primary store, so they do not
//!   trigger further propagation.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tracing::{debug, warn};

use tether_core::record::ref_uids;
use tether_core::{
    Cardinality, Filter, MutationPatch, PropagationFailure, PropagationStepFailure, Record, Uid,
};

use super::graph::{RelationEdge, RelationGraph};
use super::retry::RetryPolicy;
use crate::store::{PrimaryStore, StoreError, UpdateOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkAction {
    Link,
    Unlink,
}

/// A single opposite-side write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OppositeUpdate {
    pub action: LinkAction,
    pub collection: String,
    pub target: Uid,
    pub field: String,
    /// Cardinality of `field` on the opposite record.
    pub cardinality: Cardinality,
    /// The record whose UID is linked or unlinked.
    pub source: Uid,
}

impl OppositeUpdate {
    pub(crate) fn new(edge: &RelationEdge, action: LinkAction, target: Uid, source: &Uid) -> Self {
        Self {
            action,
            collection: edge.opposite.collection.clone(),
            target,
            field: edge.opposite.field.clone(),
            cardinality: edge.opposite.cardinality,
            source: source.clone(),
        }
    }

    fn filter(&self) -> Filter {
        let filter = Filter::uid(&self.target);
        match (self.action, self.cardinality) {
            // Only clear a scalar back-reference that still points at us.
            (LinkAction::Unlink, Cardinality::One) => filter.and(self.field.clone(), self.source.as_str()),
            _ => filter,
        }
    }

    fn patch(&self) -> MutationPatch {
        let source = Value::String(self.source.to_string());
        match (self.action, self.cardinality) {
            (LinkAction::Link, Cardinality::Many) => MutationPatch::add(self.field.clone(), [source]),
            (LinkAction::Unlink, Cardinality::Many) => MutationPatch::remove(self.field.clone(), [source]),
            (LinkAction::Link, Cardinality::One) => MutationPatch::set_field(self.field.clone(), source),
            (LinkAction::Unlink, Cardinality::One) => MutationPatch::set_field(self.field.clone(), Value::Null),
        }
    }

    fn step_failure(&self, error: &StoreError) -> PropagationStepFailure {
        PropagationStepFailure {
            collection: self.collection.clone(),
            target: self.target.clone(),
            field: self.field.clone(),
            error: error.to_string(),
        }
    }
}

/// An opposite record as it looks after a successful step.
#[derive(Debug, Clone, PartialEq)]
pub struct TouchedRecord {
    pub record: Record,
    pub field: String,
}

/// Outcome of one propagation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropagationReport {
    pub touched: Vec<TouchedRecord>,
    pub failure: Option<PropagationFailure>,
}

impl PropagationReport {
    pub fn is_clean(&self) -> bool {
        self.failure.is_none()
    }
}

pub struct Propagator {
    store: Arc<dyn PrimaryStore>,
    graph: Arc<RelationGraph>,
    retry: RetryPolicy,
}

impl Propagator {
    pub fn new(store: Arc<dyn PrimaryStore>, graph: Arc<RelationGraph>) -> Self {
        Self {
            store,
            graph,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn graph(&self) -> &Arc<RelationGraph> {
        &self.graph
    }

    pub fn plan_create(&self, record: &Record) -> Vec<OppositeUpdate> {
        let mut plan = Vec::new();
        for edge in self.graph.edges(&record.collection) {
            for target in dedup(record.refs(&edge.field)) {
                plan.push(OppositeUpdate::new(edge, LinkAction::Link, target, &record.uid));
            }
        }
        plan
    }

    /// Writes needed after `patch` turned `before` into `after`.
    pub fn plan_update(&self, before: &Record, after: &Record, patch: &MutationPatch) -> Vec<OppositeUpdate> {
        let mut plan = Vec::new();
        for edge in self.graph.edges(&after.collection) {
            let prior = before.refs(&edge.field);
            let (added, removed) = match patch {
                MutationPatch::Overwrite { fields } if fields.contains_key(&edge.field) => {
                    let current = after.refs(&edge.field);
                    (difference(&current, &prior), difference(&prior, &current))
                }
                MutationPatch::SetOp { field, add, remove } if *field == edge.field => {
                    let add: Vec<Uid> = add.iter().flat_map(ref_uids).collect();
                    let remove: Vec<Uid> = remove.iter().flat_map(ref_uids).collect();
                    let added = add
                        .into_iter()
                        .filter(|u| !prior.contains(u) && !remove.contains(u))
                        .collect();
                    let removed = remove.into_iter().filter(|u| prior.contains(u)).collect();
                    (added, removed)
                }
                _ => continue,
            };

            for target in dedup(removed) {
                plan.push(OppositeUpdate::new(edge, LinkAction::Unlink, target, &after.uid));
            }
            for target in dedup(added) {
                plan.push(OppositeUpdate::new(edge, LinkAction::Link, target, &after.uid));
            }
        }
        plan
    }

    pub fn plan_delete(&self, before: &Record) -> Vec<OppositeUpdate> {
        let mut plan = Vec::new();
        for edge in self.graph.edges(&before.collection) {
            for target in dedup(before.refs(&edge.field)) {
                plan.push(OppositeUpdate::new(edge, LinkAction::Unlink, target, &before.uid));
            }
        }
        plan
    }

    /// Issue every step concurrently and wait for all of them.
    pub async fn execute(&self, plan: Vec<OppositeUpdate>) -> PropagationReport {
        if plan.is_empty() {
            return PropagationReport::default();
        }

        let results = join_all(plan.iter().map(|step| self.apply_with_retry(step))).await;

        let mut report = PropagationReport::default();
        let mut failures = Vec::new();
        let mut succeeded = 0;
        for (step, result) in plan.iter().zip(results) {
            match result {
                Ok(touched) => {
                    succeeded += 1;
                    if let Some(record) = touched {
                        report.touched.push(TouchedRecord {
                            record,
                            field: step.field.clone(),
                        });
                    }
                }
                Err(err) => {
                    warn!(
                        collection = %step.collection,
                        target = %step.target,
                        field = %step.field,
                        error = %err,
                        "opposite-side update failed"
                    );
                    failures.push(step.step_failure(&err));
                }
            }
        }

        debug!(steps = plan.len(), failed = failures.len(), "propagation finished");
        if !failures.is_empty() {
            report.failure = Some(PropagationFailure::new(failures, succeeded));
        }
        report
    }

    async fn apply_with_retry(&self, step: &OppositeUpdate) -> Result<Option<Record>, StoreError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.apply(step).await {
                Ok(touched) => return Ok(touched),
                Err(err) if err.is_transient() && self.retry.should_retry(attempts) => {
                    let delay = self.retry.delay_for_attempt(attempts);
                    debug!(
                        collection = %step.collection,
                        target = %step.target,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying opposite-side update"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn apply(&self, step: &OppositeUpdate) -> Result<Option<Record>, StoreError> {
        let outcome = self
            .store
            .update(&step.collection, &step.filter(), &step.patch(), &UpdateOptions::default())
            .await?;

        if outcome.matched() == 0 {
            return match step.action {
                LinkAction::Unlink => Ok(None),
                LinkAction::Link => Err(StoreError::NotFound(format!(
                    "{} `{}`",
                    step.collection, step.target
                ))),
            };
        }

        match outcome.into_records() {
            Some(mut records) => Ok(records.pop()),
            None => self.store.get_one(&step.collection, &Filter::uid(&step.target)).await,
        }
    }
}

fn dedup(uids: Vec<Uid>) -> Vec<Uid> {
    let mut out: Vec<Uid> = Vec::with_capacity(uids.len());
    for uid in uids {
        if !out.contains(&uid) {
            out.push(uid);
        }
    }
    out
}

fn difference(left: &[Uid], right: &[Uid]) -> Vec<Uid> {
    left.iter().filter(|u| !right.contains(u)).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::retry::BackoffStrategy;
    use crate::store::{InMemoryStore, QueryOptions};
    use crate::test_support::{FlakyStore, fields, schema};
    use serde_json::json;
    use std::time::Duration;

    async fn setup() -> (Arc<InMemoryStore>, Propagator) {
        let schema = schema();
        let graph = Arc::new(RelationGraph::resolve(&schema).unwrap());
        let store = Arc::new(InMemoryStore::new(schema));
        let propagator = Propagator::new(store.clone(), graph);
        (store, propagator)
    }

    async fn get(store: &dyn PrimaryStore, collection: &str, uid: &str) -> Record {
        store
            .get_one(collection, &Filter::uid(&Uid::from(uid)))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn create_links_scalar_and_set_opposites() {
        let (store, propagator) = setup().await;
        store.create("auth_buckets", fields(json!({"uid": "b1"}))).await.unwrap();
        store.create("groups", fields(json!({"uid": "g1", "members": ["x"]}))).await.unwrap();
        let user = store
            .create("users", fields(json!({"uid": "u1", "auth": "b1", "groups": ["g1", "g1"]})))
            .await
            .unwrap();

        let plan = propagator.plan_create(&user);
        assert_eq!(plan.len(), 2);
        let report = propagator.execute(plan).await;

        assert!(report.is_clean());
        assert_eq!(report.touched.len(), 2);
        assert_eq!(get(&*store, "auth_buckets", "b1").await.get("user"), Some(&json!("u1")));
        assert_eq!(get(&*store, "groups", "g1").await.get("members"), Some(&json!(["x", "u1"])));
    }

    #[tokio::test]
    async fn overwrite_diff_only_touches_changed_elements() {
        let (store, propagator) = setup().await;
        for g in ["g1", "g2", "g3"] {
            store
                .create("groups", fields(json!({"uid": g, "members": ["u1"]})))
                .await
                .unwrap();
        }
        let before = Record::new("users", "u1", fields(json!({"groups": ["g1", "g2"]})));
        let after = Record::new("users", "u1", fields(json!({"groups": ["g2", "g3"]})));
        let patch = MutationPatch::set_field("groups", json!(["g2", "g3"]));

        let plan = propagator.plan_update(&before, &after, &patch);

        assert_eq!(
            plan.iter().map(|s| (s.action, s.target.to_string())).collect::<Vec<_>>(),
            vec![(LinkAction::Unlink, "g1".to_string()), (LinkAction::Link, "g3".to_string())]
        );
    }

    #[tokio::test]
    async fn set_op_translates_to_element_writes() {
        let (_store, propagator) = setup().await;
        let before = Record::new("users", "u1", fields(json!({"groups": ["g1"]})));
        let after = Record::new("users", "u1", fields(json!({"groups": ["g2"]})));
        let patch = MutationPatch::SetOp {
            field: "groups".into(),
            add: vec![json!("g1"), json!("g2")],
            remove: vec![json!("g1"), json!("g9")],
        };

        let plan = propagator.plan_update(&before, &after, &patch);

        assert_eq!(
            plan.iter().map(|s| (s.action, s.target.to_string())).collect::<Vec<_>>(),
            vec![(LinkAction::Unlink, "g1".to_string()), (LinkAction::Link, "g2".to_string())]
        );
    }

    #[tokio::test]
    async fn patch_not_touching_links_plans_nothing() {
        let (_store, propagator) = setup().await;
        let before = Record::new("users", "u1", fields(json!({"auth": "b1"})));
        let after = Record::new("users", "u1", fields(json!({"auth": "b1", "firstName": "Z"})));
        assert!(propagator
            .plan_update(&before, &after, &MutationPatch::set_field("firstName", "Z"))
            .is_empty());
    }

    #[tokio::test]
    async fn unlink_scalar_only_clears_matching_back_reference() {
        let (store, propagator) = setup().await;
        store
            .create("auth_buckets", fields(json!({"uid": "b1", "user": "someone-else"})))
            .await
            .unwrap();
        let before = Record::new("users", "u1", fields(json!({"auth": "b1"})));

        let report = propagator.execute(propagator.plan_delete(&before)).await;

        assert!(report.is_clean());
        assert!(report.touched.is_empty());
        assert_eq!(get(&*store, "auth_buckets", "b1").await.get("user"), Some(&json!("someone-else")));
    }

    #[tokio::test]
    async fn missing_target_fails_only_that_step() {
        let (store, propagator) = setup().await;
        store.create("groups", fields(json!({"uid": "g1"}))).await.unwrap();
        let user = Record::new("users", "u1", fields(json!({"groups": ["g1", "ghost"]})));

        let report = propagator.execute(propagator.plan_create(&user)).await;

        let failure = report.failure.unwrap();
        assert_eq!(failure.succeeded, 1);
        assert_eq!(failure.failures.len(), 1);
        assert_eq!(failure.failures[0].target, "ghost");
        assert_eq!(get(&*store, "groups", "g1").await.get("members"), Some(&json!(["u1"])));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let schema = schema();
        let graph = Arc::new(RelationGraph::resolve(&schema).unwrap());
        let store = Arc::new(FlakyStore::new(schema));
        store.create("auth_buckets", fields(json!({"uid": "b1"}))).await.unwrap();
        store.fail_updates("auth_buckets", 2);
        let propagator = Propagator::new(store.clone(), graph)
            .with_retry(RetryPolicy::fixed(3, Duration::from_millis(1)));

        let user = Record::new("users", "u1", fields(json!({"auth": "b1"})));
        let report = propagator.execute(propagator.plan_create(&user)).await;

        assert!(report.is_clean());
        assert_eq!(store.update_calls("auth_buckets"), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_failure_without_rollback() {
        let schema = schema();
        let graph = Arc::new(RelationGraph::resolve(&schema).unwrap());
        let store = Arc::new(FlakyStore::new(schema));
        store.create("auth_buckets", fields(json!({"uid": "b1"}))).await.unwrap();
        store.create("groups", fields(json!({"uid": "g1"}))).await.unwrap();
        store.fail_updates("auth_buckets", 10);
        let propagator = Propagator::new(store.clone(), graph).with_retry(RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
            strategy: BackoffStrategy::Fixed,
        });

        let user = Record::new("users", "u1", fields(json!({"auth": "b1", "groups": ["g1"]})));
        let report = propagator.execute(propagator.plan_create(&user)).await;

        let failure = report.failure.unwrap();
        assert!(failure.is_partial());
        assert_eq!(failure.failures[0].collection, "auth_buckets");
        assert_eq!(store.update_calls("auth_buckets"), 2);

        let groups = store
            .get_many("groups", &Filter::all().and("members", "u1"), &QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(groups.len(), 1);
    }
}
