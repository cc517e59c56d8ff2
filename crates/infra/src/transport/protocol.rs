//! Wire messages exchanged with clients.
//!
//! Inbound (client to server), JSON with a `type` tag:
//!
//! ```json
//! {"type":"subscribe","requestId":"r1","kind":"query","collection":"users","filter":{},"options":{"limit":10}}
//! {"type":"subscribe","kind":"doc","collection":"users","uid":"u1"}
//! {"type":"unsubscribe","subscriptionId":"0190…"}
//! ```
//!
//! Outbound frames carry a channel name and a payload. Snapshots travel on
//! [`channels::SNAPSHOT`], subscribe acknowledgements and request errors on
//! [`channels::SUBSCRIPTION`].

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use tether_core::{Filter, SubscriptionId, TetherError, Uid};

use super::TransportError;
use crate::store::QueryOptions;

pub mod channels {
    pub const SNAPSHOT: &str = "snapshot";
    pub const SUBSCRIPTION: &str = "subscription";
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    Doc,
    Query,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub kind: SubscriptionKind,
    pub collection: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<Filter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<Uid>,
    #[serde(default)]
    pub options: QueryOptions,
}

impl SubscribeMessage {
    pub fn query(collection: impl Into<String>, filter: Filter) -> Self {
        Self {
            request_id: None,
            kind: SubscriptionKind::Query,
            collection: collection.into(),
            filter: Some(filter),
            uid: None,
            options: QueryOptions::default(),
        }
    }

    pub fn doc(collection: impl Into<String>, uid: impl Into<Uid>) -> Self {
        Self {
            request_id: None,
            kind: SubscriptionKind::Doc,
            collection: collection.into(),
            filter: None,
            uid: Some(uid.into()),
            options: QueryOptions::default(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_options(mut self, options: QueryOptions) -> Self {
        self.options = options;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe(SubscribeMessage),
    Unsubscribe {
        #[serde(rename = "subscriptionId")]
        subscription_id: SubscriptionId,
    },
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, TransportError> {
        serde_json::from_str(text).map_err(|e| TransportError::Malformed(e.to_string()))
    }
}

/// One outbound push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundFrame {
    pub channel: String,
    pub payload: Value,
}

fn error_body(err: &TetherError) -> Value {
    json!({ "name": err.name(), "message": err.to_string() })
}

/// `{subscriptionId, success: true, data}`
pub fn snapshot_payload(id: SubscriptionId, data: Value) -> Value {
    json!({ "subscriptionId": id, "success": true, "data": data })
}

/// `{subscriptionId, success: false, error: {name, message}}`
pub fn snapshot_error_payload(id: SubscriptionId, err: &TetherError) -> Value {
    json!({ "subscriptionId": id, "success": false, "error": error_body(err) })
}

/// Subscribe acknowledgement.
pub fn subscribed_payload(request_id: Option<&str>, id: SubscriptionId) -> Value {
    json!({ "requestId": request_id, "subscriptionId": id, "success": true })
}

pub fn unsubscribed_payload(id: SubscriptionId, removed: bool) -> Value {
    json!({ "subscriptionId": id, "success": removed, "unsubscribed": removed })
}

/// Rejected subscribe or unsubscribe request.
pub fn request_error_payload(request_id: Option<&str>, err: &TetherError) -> Value {
    json!({ "requestId": request_id, "success": false, "error": error_body(err) })
}
