use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use tether_core::ConnectionId;

use super::protocol::{ClientMessage, OutboundFrame};
use super::{Delivery, DisconnectHandler, MessageHandler, Transport, TransportError};

/// Called for every new connection.
pub type ConnectHandler = Arc<dyn Fn(ConnectionId) + Send + Sync>;

struct Connection {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    message_handlers: Vec<MessageHandler>,
    disconnect_handlers: Vec<DisconnectHandler>,
}

/// The server side of an accepted connection: its id and the outbound stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
}

/// In-process transport.
///
/// - One unbounded queue per connection, so a slow reader only backs up itself
/// - Inbound messages are fed with [`ChannelTransport::deliver`]
/// - A push that finds the receiver gone is dropped; callers then `disconnect`
#[derive(Default)]
pub struct ChannelTransport {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    connect_handlers: Mutex<Vec<ConnectHandler>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, Connection>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `handler` for every connection opened from now on.
    pub fn on_connect(&self, handler: ConnectHandler) {
        self.connect_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Open a connection.
    pub fn connect(&self) -> ConnectionHandle {
        let id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(
            id,
            Connection {
                outbound: tx,
                message_handlers: Vec::new(),
                disconnect_handlers: Vec::new(),
            },
        );
        debug!(connection_id = %id, "connection opened");

        let handlers = self
            .connect_handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            handler(id);
        }

        ConnectionHandle { id, outbound: rx }
    }

    /// Feed an inbound client message to the connection's handlers, in order.
    pub async fn deliver(&self, connection: ConnectionId, message: ClientMessage) -> Result<(), TransportError> {
        let handlers = {
            let connections = self.lock();
            let conn = connections
                .get(&connection)
                .ok_or(TransportError::UnknownConnection(connection))?;
            conn.message_handlers.clone()
        };
        for handler in handlers {
            handler(message.clone()).await;
        }
        Ok(())
    }

    pub fn connection_count(&self) -> usize {
        self.lock().len()
    }
}

impl Transport for ChannelTransport {
    fn push(&self, connection: ConnectionId, channel: &str, payload: Value) -> Delivery {
        let connections = self.lock();
        let Some(conn) = connections.get(&connection) else {
            debug!(connection_id = %connection, channel, "push to unknown connection dropped");
            return Delivery::Dropped;
        };
        let frame = OutboundFrame {
            channel: channel.to_string(),
            payload,
        };
        match conn.outbound.send(frame) {
            Ok(()) => Delivery::Queued,
            Err(_) => {
                warn!(connection_id = %connection, channel, "push to closed connection dropped");
                Delivery::Dropped
            }
        }
    }

    fn on_message(&self, connection: ConnectionId, handler: MessageHandler) -> Result<(), TransportError> {
        let mut connections = self.lock();
        let conn = connections
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        conn.message_handlers.push(handler);
        Ok(())
    }

    fn on_disconnect(&self, connection: ConnectionId, handler: DisconnectHandler) -> Result<(), TransportError> {
        let mut connections = self.lock();
        let conn = connections
            .get_mut(&connection)
            .ok_or(TransportError::UnknownConnection(connection))?;
        conn.disconnect_handlers.push(handler);
        Ok(())
    }

    fn is_connected(&self, connection: ConnectionId) -> bool {
        self.lock()
            .get(&connection)
            .is_some_and(|c| !c.outbound.is_closed())
    }

    fn disconnect(&self, connection: ConnectionId) {
        // Removal happens once, so handlers run at most once.
        let Some(conn) = self.lock().remove(&connection) else {
            return;
        };
        debug!(
            connection_id = %connection,
            handlers = conn.disconnect_handlers.len(),
            "connection closed"
        );
        for handler in conn.disconnect_handlers {
            handler(connection);
        }
    }
}
