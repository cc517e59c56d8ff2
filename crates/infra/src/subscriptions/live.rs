use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use tether_core::{ConnectionId, Filter, Operation, SubscriptionId, Uid};
use tether_events::Topic;

use crate::store::QueryOptions;
use crate::transport::{Delivery, Transport};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Target {
    Query { filter: Filter, options: QueryOptions },
    Document { uid: Uid, options: QueryOptions },
}

/// What the last pushed snapshot contained.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum LastSeen {
    Uids(Vec<Uid>),
    Snapshot(Value),
}

/// A live subscription.
///
/// Holds its owning connection by id; the registry resolves ownership.
pub(crate) struct LiveSubscription {
    pub id: SubscriptionId,
    pub connection: ConnectionId,
    pub collection: String,
    pub target: Target,
    /// Push gate: held while pushing, cleared on unsubscribe.
    active: Mutex<bool>,
    /// Serialises refreshes and holds the last snapshot.
    pub last: tokio::sync::Mutex<LastSeen>,
}

impl LiveSubscription {
    pub fn new(connection: ConnectionId, collection: String, target: Target) -> Self {
        let last = match &target {
            Target::Query { .. } => LastSeen::Uids(Vec::new()),
            Target::Document { .. } => LastSeen::Snapshot(Value::Null),
        };
        Self {
            id: SubscriptionId::new(),
            connection,
            collection,
            target,
            active: Mutex::new(true),
            last: tokio::sync::Mutex::new(last),
        }
    }

    pub fn is_active(&self) -> bool {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Once this returns, no further push goes out.
    pub fn deactivate(&self) {
        *self.active.lock().unwrap_or_else(PoisonError::into_inner) = false;
    }

    /// Push unless deactivated. `None` when the gate is closed.
    pub fn push(&self, transport: &dyn Transport, channel: &str, payload: Value) -> Option<Delivery> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if !*active {
            return None;
        }
        Some(transport.push(self.connection, channel, payload))
    }

    pub fn options(&self) -> &QueryOptions {
        match &self.target {
            Target::Query { options, .. } | Target::Document { options, .. } => options,
        }
    }

    pub fn topics(&self) -> Vec<Topic> {
        match &self.target {
            Target::Query { .. } => vec![
                Topic::created(&self.collection),
                Topic::updated(&self.collection),
                Topic::deleted(&self.collection),
            ],
            Target::Document { uid, .. } => vec![
                Topic::record(Operation::Update, &self.collection, uid),
                Topic::record(Operation::Delete, &self.collection, uid),
            ],
        }
    }
}
