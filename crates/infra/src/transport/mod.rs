//! Transport adapter: addressable per-connection channels.
//!
//! The registry pushes snapshots through [`Transport::push`] and learns about
//! inbound requests and disconnects through the handlers it registers per
//! connection. Pushing never fails from the caller's point of view: a push to
//! an unknown or closed connection is dropped and reported as
//! [`Delivery::Dropped`], which callers treat as a reason to `disconnect`.

pub mod channel;
pub mod protocol;

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

use tether_core::{ConnectionId, TetherError};

pub use channel::{ChannelTransport, ConnectionHandle};
pub use protocol::{ClientMessage, OutboundFrame, SubscribeMessage, SubscriptionKind, channels};

/// Inbound request handler, run once per message.
pub type MessageHandler = Arc<dyn Fn(ClientMessage) -> BoxFuture<'static, ()> + Send + Sync>;

/// Runs at most once, when the connection closes.
pub type DisconnectHandler = Box<dyn FnOnce(ConnectionId) + Send>;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// Unknown or closed connection; nothing was sent.
    Dropped,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("unknown or closed connection {0}")]
    UnknownConnection(ConnectionId),

    #[error("malformed client message: {0}")]
    Malformed(String),
}

impl From<TransportError> for TetherError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::UnknownConnection(id) => TetherError::Transport(format!("connection {id} is closed")),
            TransportError::Malformed(msg) => TetherError::validation(msg),
        }
    }
}

pub trait Transport: Send + Sync {
    /// Queue `payload` on `channel` for `connection`. Never blocks and never
    /// runs disconnect handlers itself.
    fn push(&self, connection: ConnectionId, channel: &str, payload: Value) -> Delivery;

    fn on_message(&self, connection: ConnectionId, handler: MessageHandler) -> Result<(), TransportError>;

    /// Fails when the connection is already gone; the handler is not kept.
    fn on_disconnect(&self, connection: ConnectionId, handler: DisconnectHandler) -> Result<(), TransportError>;

    fn is_connected(&self, connection: ConnectionId) -> bool;

    /// Close `connection` and run its disconnect handlers. Idempotent.
    fn disconnect(&self, connection: ConnectionId);
}

impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    fn push(&self, connection: ConnectionId, channel: &str, payload: Value) -> Delivery {
        (**self).push(connection, channel, payload)
    }

    fn on_message(&self, connection: ConnectionId, handler: MessageHandler) -> Result<(), TransportError> {
        (**self).on_message(connection, handler)
    }

    fn on_disconnect(&self, connection: ConnectionId, handler: DisconnectHandler) -> Result<(), TransportError> {
        (**self).on_disconnect(connection, handler)
    }

    fn is_connected(&self, connection: ConnectionId) -> bool {
        (**self).is_connected(connection)
    }

    fn disconnect(&self, connection: ConnectionId) {
        (**self).disconnect(connection)
    }
}
