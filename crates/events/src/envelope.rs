use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Topic;

/// Envelope for a published message: the topic it was published on plus
/// delivery metadata.
///
/// Every listener bound to the topic receives the same envelope (shared via `Arc`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<M> {
    event_id: Uuid,
    topic: Topic,
    published_at: DateTime<Utc>,
    payload: M,
}

impl<M> EventEnvelope<M> {
    pub fn new(topic: Topic, payload: M) -> Self {
        Self {
            event_id: Uuid::now_v7(),
            topic,
            published_at: Utc::now(),
            payload,
        }
    }

    pub fn event_id(&self) -> Uuid {
        self.event_id
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn published_at(&self) -> DateTime<Utc> {
        self.published_at
    }

    pub fn payload(&self) -> &M {
        &self.payload
    }

    pub fn into_payload(self) -> M {
        self.payload
    }
}
