//! Subscription registry.
//!
//! Tracks live query and document subscriptions per connection, listens on the
//! event bus and pushes complete snapshots (no diffing) when a relevant
//! mutation happens.
//!
//! ## Relevance
//!
//! - query subscription, create event: the new record passes an existence
//!   probe `get_one(collection, filter ∧ uid)`
//! - query subscription, update event: always (the query is re-run)
//! - query subscription, delete event: the deleted UID was in the last snapshot
//! - document subscription: every event on its per-record topics
//!
//! ## Lifetime
//!
//! Every subscription belongs to one connection. The first subscription on a
//! connection registers a disconnect handler, so closing the connection
//! disposes all of its subscriptions. `unsubscribe` and `dispose_connection`
//! are synchronous: when they return, the bus listeners are gone and no new
//! push will be issued.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

use tether_core::filter::UID_KEY;
use tether_core::{
    ConnectionId, Filter, MutationEvent, Operation, SubscriptionId, TetherError, TetherResult,
};
use tether_events::{EventBus, EventEnvelope, ListenerGuard, listener};

use super::live::{LastSeen, LiveSubscription, Target};
use crate::relations::{RelationGraph, populate};
use crate::store::PrimaryStore;
use crate::transport::protocol::{
    channels, request_error_payload, snapshot_error_payload, snapshot_payload, subscribed_payload,
    unsubscribed_payload,
};
use crate::transport::{ClientMessage, Delivery, SubscribeMessage, SubscriptionKind, Transport};

/// Read-only view of a registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub connection: ConnectionId,
    pub collection: String,
    pub kind: SubscriptionKind,
}

struct Entry {
    live: Arc<LiveSubscription>,
    // Dropping the guards detaches the bus listeners.
    _guards: Vec<ListenerGuard>,
}

#[derive(Default)]
struct RegistryState {
    subscriptions: HashMap<SubscriptionId, Entry>,
    by_connection: HashMap<ConnectionId, Vec<SubscriptionId>>,
    attached: HashSet<ConnectionId>,
}

/// Collaborators shared with bus listeners.
struct Context {
    store: Arc<dyn PrimaryStore>,
    transport: Arc<dyn Transport>,
    graph: Arc<RelationGraph>,
}

pub struct SubscriptionRegistry {
    ctx: Arc<Context>,
    bus: Arc<dyn EventBus<MutationEvent>>,
    state: Mutex<RegistryState>,
    me: Weak<SubscriptionRegistry>,
}

impl SubscriptionRegistry {
    pub fn new(
        store: Arc<dyn PrimaryStore>,
        bus: Arc<dyn EventBus<MutationEvent>>,
        transport: Arc<dyn Transport>,
        graph: Arc<RelationGraph>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            ctx: Arc::new(Context {
                store,
                transport,
                graph,
            }),
            bus,
            state: Mutex::new(RegistryState::default()),
            me: me.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Route the connection's inbound messages to this registry and dispose
    /// its subscriptions when it closes.
    pub fn attach(&self, connection: ConnectionId) -> TetherResult<()> {
        self.ensure_disposal(connection)?;

        let me = self.me.clone();
        self.ctx.transport.on_message(
            connection,
            Arc::new(move |message: ClientMessage| {
                let me = me.clone();
                async move {
                    if let Some(registry) = me.upgrade() {
                        registry.handle_message(connection, message).await;
                    }
                }
                .boxed()
            }),
        )?;
        Ok(())
    }

    fn ensure_disposal(&self, connection: ConnectionId) -> TetherResult<()> {
        if !self.lock().attached.insert(connection) {
            return Ok(());
        }

        let me = self.me.clone();
        let registered = self.ctx.transport.on_disconnect(
            connection,
            Box::new(move |closed| {
                if let Some(registry) = me.upgrade() {
                    registry.dispose_connection(closed);
                }
            }),
        );
        if let Err(err) = registered {
            self.lock().attached.remove(&connection);
            return Err(err.into());
        }
        Ok(())
    }

    /// Handle one inbound client message. Failures are answered on the
    /// `subscription` channel, never returned.
    pub async fn handle_message(&self, connection: ConnectionId, message: ClientMessage) {
        match message {
            ClientMessage::Subscribe(request) => {
                let request_id = request.request_id.clone();
                if let Err(err) = self.subscribe(connection, request).await {
                    warn!(connection_id = %connection, error = %err, "subscribe rejected");
                    self.push_control(connection, request_error_payload(request_id.as_deref(), &err));
                }
            }
            ClientMessage::Unsubscribe { subscription_id } => {
                let owned = self
                    .subscription(subscription_id)
                    .is_some_and(|info| info.connection == connection);
                let removed = owned && self.unsubscribe(subscription_id);
                self.push_control(connection, unsubscribed_payload(subscription_id, removed));
            }
        }
    }

    /// Register a subscription, push its acknowledgement and initial snapshot.
    pub async fn subscribe(
        &self,
        connection: ConnectionId,
        request: SubscribeMessage,
    ) -> TetherResult<SubscriptionId> {
        let target = self.validate(&request)?;
        if !self.ctx.transport.is_connected(connection) {
            return Err(TetherError::Transport(format!("connection {connection} is closed")));
        }
        self.ensure_disposal(connection)?;

        let live = Arc::new(LiveSubscription::new(connection, request.collection.clone(), target));
        let id = live.id;

        // Events published from here on wait for the initial snapshot.
        let mut last = live.last.lock().await;

        let guards = live
            .topics()
            .iter()
            .map(|topic| self.bus.subscribe(topic, self.listener_for(&live)))
            .collect();
        {
            let mut state = self.lock();
            state.subscriptions.insert(
                id,
                Entry {
                    live: live.clone(),
                    _guards: guards,
                },
            );
            state.by_connection.entry(connection).or_default().push(id);
        }
        if !self.ctx.transport.is_connected(connection) {
            self.unsubscribe(id);
            return Err(TetherError::Transport(format!("connection {connection} is closed")));
        }

        let (data, seen) = match self.ctx.fetch(&live).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                drop(last);
                self.unsubscribe(id);
                return Err(err);
            }
        };
        *last = seen;

        live.push(
            self.ctx.transport.as_ref(),
            channels::SUBSCRIPTION,
            subscribed_payload(request.request_id.as_deref(), id),
        );
        self.ctx.deliver(&live, snapshot_payload(id, data));
        drop(last);

        info!(
            subscription_id = %id,
            connection_id = %connection,
            collection = %request.collection,
            kind = ?request.kind,
            "subscribed"
        );
        Ok(id)
    }

    /// Remove a subscription. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let entry = {
            let mut state = self.lock();
            let Some(entry) = state.subscriptions.remove(&id) else {
                return false;
            };
            let connection = entry.live.connection;
            if let Some(ids) = state.by_connection.get_mut(&connection) {
                ids.retain(|s| *s != id);
                if ids.is_empty() {
                    state.by_connection.remove(&connection);
                }
            }
            entry
        };

        entry.live.deactivate();
        drop(entry);
        debug!(subscription_id = %id, "unsubscribed");
        true
    }

    /// Remove every subscription owned by `connection`. Idempotent.
    pub fn dispose_connection(&self, connection: ConnectionId) -> usize {
        let entries: Vec<Entry> = {
            let mut state = self.lock();
            state.attached.remove(&connection);
            let ids = state.by_connection.remove(&connection).unwrap_or_default();
            ids.iter().filter_map(|id| state.subscriptions.remove(id)).collect()
        };

        for entry in &entries {
            entry.live.deactivate();
        }
        let disposed = entries.len();
        drop(entries);

        if disposed > 0 {
            info!(connection_id = %connection, disposed, "connection subscriptions disposed");
        }
        disposed
    }

    pub fn subscription_count(&self) -> usize {
        self.lock().subscriptions.len()
    }

    pub fn connection_subscriptions(&self, connection: ConnectionId) -> Vec<SubscriptionId> {
        self.lock()
            .by_connection
            .get(&connection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn subscription(&self, id: SubscriptionId) -> Option<SubscriptionInfo> {
        self.lock().subscriptions.get(&id).map(|entry| {
            let live = &entry.live;
            SubscriptionInfo {
                id: live.id,
                connection: live.connection,
                collection: live.collection.clone(),
                kind: match live.target {
                    Target::Query { .. } => SubscriptionKind::Query,
                    Target::Document { .. } => SubscriptionKind::Doc,
                },
            }
        })
    }

    fn push_control(&self, connection: ConnectionId, payload: Value) {
        if self.ctx.transport.push(connection, channels::SUBSCRIPTION, payload) == Delivery::Dropped {
            self.ctx.transport.disconnect(connection);
        }
    }

    fn listener_for(&self, live: &Arc<LiveSubscription>) -> tether_events::Listener<MutationEvent> {
        let ctx = self.ctx.clone();
        let live = live.clone();
        listener(move |envelope: Arc<EventEnvelope<MutationEvent>>| {
            let ctx = ctx.clone();
            let live = live.clone();
            async move {
                ctx.on_event(&live, envelope.payload()).await;
                Ok(())
            }
        })
    }

    fn validate(&self, request: &SubscribeMessage) -> TetherResult<Target> {
        let schema = self.ctx.store.schema();
        let collection = schema.require(&request.collection)?;

        match request.kind {
            SubscriptionKind::Query => {
                let filter = request.filter.clone().unwrap_or_default();
                for (field, _) in filter.fields() {
                    if field != UID_KEY && collection.get(field).is_none() {
                        return Err(TetherError::validation(format!(
                            "filter field `{field}` is not declared on `{}`",
                            request.collection
                        )));
                    }
                }
                Ok(Target::Query {
                    filter,
                    options: request.options.clone(),
                })
            }
            SubscriptionKind::Doc => match &request.uid {
                Some(uid) if !uid.as_str().is_empty() => Ok(Target::Document {
                    uid: uid.clone(),
                    options: request.options.clone(),
                }),
                _ => Err(TetherError::validation("document subscription needs a uid")),
            },
        }
    }
}

impl Context {
    async fn on_event(&self, live: &LiveSubscription, event: &MutationEvent) {
        if !live.is_active() {
            return;
        }
        let mut last = live.last.lock().await;
        if !live.is_active() || !self.is_relevant(live, event, &last).await {
            return;
        }

        match self.fetch(live).await {
            Ok((data, seen)) => {
                *last = seen;
                debug!(
                    subscription_id = %live.id,
                    operation = %event.operation,
                    collection = %event.collection,
                    "snapshot refreshed"
                );
                self.deliver(live, snapshot_payload(live.id, data));
            }
            Err(err) => {
                warn!(subscription_id = %live.id, error = %err, "snapshot refresh failed");
                self.deliver(live, snapshot_error_payload(live.id, &err));
            }
        }
    }

    async fn is_relevant(&self, live: &LiveSubscription, event: &MutationEvent, last: &LastSeen) -> bool {
        let Target::Query { filter, .. } = &live.target else {
            return true;
        };
        let Some(uid) = event.uid() else {
            return false;
        };

        match event.operation {
            Operation::Update => true,
            Operation::Delete => matches!(last, LastSeen::Uids(uids) if uids.contains(uid)),
            Operation::Create => {
                if filter.pinned_uid().is_some_and(|pinned| pinned != *uid) {
                    return false;
                }
                match self.store.get_one(&live.collection, &filter.with_uid(uid)).await {
                    Ok(found) => found.is_some(),
                    // Let the refresh surface the failure.
                    Err(_) => true,
                }
            }
        }
    }

    async fn fetch(&self, live: &LiveSubscription) -> TetherResult<(Value, LastSeen)> {
        let depth = live.options().populate;
        match &live.target {
            Target::Query { filter, options } => {
                let records = self.store.get_many(&live.collection, filter, options).await?;
                let uids = records.iter().map(|r| r.uid.clone()).collect();
                let mut data = Vec::with_capacity(records.len());
                for record in &records {
                    data.push(self.render(record, depth).await?);
                }
                Ok((Value::Array(data), LastSeen::Uids(uids)))
            }
            Target::Document { uid, .. } => {
                let record = self.store.get_one(&live.collection, &Filter::uid(uid)).await?;
                let data = match record {
                    Some(record) => self.render(&record, depth).await?,
                    None => Value::Null,
                };
                Ok((data.clone(), LastSeen::Snapshot(data)))
            }
        }
    }

    async fn render(&self, record: &tether_core::Record, depth: usize) -> TetherResult<Value> {
        if depth == 0 {
            return Ok(record.to_json());
        }
        Ok(populate(self.store.as_ref(), &self.graph, record, depth).await?)
    }

    /// Push a snapshot; a dead connection is closed, which disposes its subscriptions.
    fn deliver(&self, live: &LiveSubscription, payload: Value) {
        if live.push(self.transport.as_ref(), channels::SNAPSHOT, payload) == Some(Delivery::Dropped) {
            debug!(subscription_id = %live.id, connection_id = %live.connection, "snapshot dropped");
            self.transport.disconnect(live.connection);
        }
    }
}
