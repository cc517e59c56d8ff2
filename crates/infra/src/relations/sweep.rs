//! Periodic repair of missing back-references.
//!
//! Propagation is best effort; a failed step leaves one side of a link without
//! its mirror. The sweep scans every linked collection and re-issues the
//! missing link writes through the [`Propagator`]. Repaired records are
//! announced on the bus like any other back-reference write.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tether_core::{Cardinality, Filter, MutationEvent, PropagationFailure};
use tether_events::EventBus;

use super::propagator::{LinkAction, OppositeUpdate, Propagator};
use crate::hooks::announce_touched;
use crate::store::{PrimaryStore, QueryOptions, StoreError};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Records inspected.
    pub scanned: usize,
    /// Back-references written.
    pub repaired: usize,
    /// Links whose target record no longer exists.
    pub dangling: usize,
    /// Scalar back-references already pointing at another record.
    pub conflicts: usize,
    pub failure: Option<PropagationFailure>,
}

pub struct ConsistencySweep {
    store: Arc<dyn PrimaryStore>,
    propagator: Arc<Propagator>,
    bus: Arc<dyn EventBus<MutationEvent>>,
}

impl ConsistencySweep {
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

    /// One full pass over every linked collection.
    pub async fn run(&self) -> Result<SweepReport, StoreError> {
        let graph = self.propagator.graph().clone();
        let mut report = SweepReport::default();
        let mut plan = Vec::new();

        for collection in graph.linked_collections() {
            let records = self
                .store
                .get_many(collection, &Filter::all(), &QueryOptions::default())
                .await?;

            for record in &records {
                report.scanned += 1;
                for edge in graph.edges(collection) {
                    for target in record.refs(&edge.field) {
                        let opposite = self
                            .store
                            .get_one(&edge.opposite.collection, &Filter::uid(&target))
                            .await?;
                        let Some(opposite) = opposite else {
                            report.dangling += 1;
                            continue;
                        };

                        let mirrored = opposite.refs(&edge.opposite.field);
                        if mirrored.contains(&record.uid) {
                            continue;
                        }
                        let vacant = matches!(opposite.get(&edge.opposite.field), None | Some(Value::Null));
                        if edge.opposite.cardinality == Cardinality::One && !vacant {
                            report.conflicts += 1;
                            continue;
                        }
                        plan.push(OppositeUpdate::new(edge, LinkAction::Link, target, &record.uid));
                    }
                }
            }
        }

        let planned = plan.len();
        let outcome = self.propagator.execute(plan).await;
        announce_touched(self.bus.as_ref(), &outcome).await;
        let failed = outcome.failure.as_ref().map(|f| f.failures.len()).unwrap_or(0);
        report.repaired = planned - failed;
        report.failure = outcome.failure;

        if report.repaired > 0 || failed > 0 {
            info!(
                scanned = report.scanned,
                repaired = report.repaired,
                failed,
                dangling = report.dangling,
                conflicts = report.conflicts,
                "consistency sweep repaired links"
            );
        } else {
            debug!(scanned = report.scanned, "consistency sweep found nothing to repair");
        }
        Ok(report)
    }

    /// Run the sweep every `interval` on a tokio task.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SweepHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.run().await {
                            warn!(error = %err, "consistency sweep aborted");
                        }
                    }
                }
            }
            debug!("consistency sweep stopped");
        });

        SweepHandle {
            shutdown: Some(shutdown_tx),
            join: Some(join),
        }
    }
}

/// Handle to stop and join a spawned sweep.
#[derive(Debug)]
pub struct SweepHandle {
    shutdown: Option<oneshot::Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl SweepHandle {
    /// Request graceful shutdown and wait for the current pass to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relations::RelationGraph;
    use crate::store::InMemoryStore;
    use crate::test_support::{fields, schema};
    use serde_json::json;
    use std::sync::Mutex;
    use tether_core::{Operation, Uid};
    use tether_events::{EventEnvelope, InMemoryEventBus, Topic, listener};

    async fn setup() -> (Arc<InMemoryStore>, Arc<ConsistencySweep>) {
        let (store, sweep, _bus) = setup_with_bus().await;
        (store, sweep)
    }

    async fn setup_with_bus() -> (
        Arc<InMemoryStore>,
        Arc<ConsistencySweep>,
        Arc<InMemoryEventBus<MutationEvent>>,
    ) {
        let schema = schema();
        let graph = Arc::new(RelationGraph::resolve(&schema).unwrap());
        let store = Arc::new(InMemoryStore::new(schema));
        let propagator = Arc::new(Propagator::new(store.clone(), graph));
        let bus = Arc::new(InMemoryEventBus::new());
        let sweep = ConsistencySweep::new(store.clone(), propagator, bus.clone());
        (store, Arc::new(sweep), bus)
    }

    #[tokio::test]
    async fn repairs_missing_back_references() {
        let (store, sweep) = setup().await;
        // Written straight to the store, so nothing propagated.
        store.create("auth_buckets", fields(json!({"uid": "b1"}))).await.unwrap();
        store.create("groups", fields(json!({"uid": "g1", "members": []}))).await.unwrap();
        store
            .create("users", fields(json!({"uid": "u1", "auth": "b1", "groups": ["g1", "ghost"]})))
            .await
            .unwrap();

        let report = sweep.run().await.unwrap();

        assert_eq!(report.repaired, 2);
        assert_eq!(report.dangling, 1);
        assert!(report.failure.is_none());
        let bucket = store.get_one("auth_buckets", &Filter::uid(&Uid::from("b1"))).await.unwrap().unwrap();
        assert_eq!(bucket.get("user"), Some(&json!("u1")));

        let again = sweep.run().await.unwrap();
        assert_eq!(again.repaired, 0);
    }

    #[tokio::test]
    async fn repaired_records_are_announced() {
        let (store, sweep, bus) = setup_with_bus().await;
        store.create("groups", fields(json!({"uid": "g1", "members": []}))).await.unwrap();
        store.create("users", fields(json!({"uid": "u1", "groups": ["g1"]}))).await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _guard = bus.subscribe(
            &Topic::record(Operation::Update, "groups", &Uid::from("g1")),
            listener(move |env: Arc<EventEnvelope<MutationEvent>>| {
                let sink = sink.clone();
                async move {
                    sink.lock().unwrap().push(env.payload().clone());
                    Ok(())
                }
            }),
        );

        assert_eq!(sweep.run().await.unwrap().repaired, 1);

        let event = {
            let seen = seen.lock().unwrap();
            assert_eq!(seen.len(), 1);
            seen[0].clone()
        };
        assert_eq!(event.after.map(|r| r.refs("members")), Some(vec![Uid::from("u1")]));

        sweep.run().await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn occupied_scalar_back_reference_is_a_conflict() {
        let (store, sweep) = setup().await;
        store
            .create("auth_buckets", fields(json!({"uid": "b1", "user": "u2"})))
            .await
            .unwrap();
        store.create("users", fields(json!({"uid": "u1", "auth": "b1"}))).await.unwrap();
        store.create("users", fields(json!({"uid": "u2", "auth": "b1"}))).await.unwrap();

        let report = sweep.run().await.unwrap();

        assert_eq!(report.conflicts, 1);
        assert_eq!(report.repaired, 0);
    }

    #[tokio::test]
    async fn spawned_sweep_runs_and_shuts_down() {
        let (store, sweep) = setup().await;
        store.create("auth_buckets", fields(json!({"uid": "b1"}))).await.unwrap();
        store.create("users", fields(json!({"uid": "u1", "auth": "b1"}))).await.unwrap();

        let handle = sweep.spawn(Duration::from_millis(10));
        let mut repaired = false;
        for _ in 0..50 {
            let bucket = store.get_one("auth_buckets", &Filter::uid(&Uid::from("b1"))).await.unwrap().unwrap();
            if bucket.get("user") == Some(&json!("u1")) {
                repaired = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.shutdown().await;
        assert!(repaired);
    }
}
