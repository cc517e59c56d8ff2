//! `GET /ws`: one WebSocket session per transport connection.
//!
//! Inbound text frames are JSON client messages (`subscribe`, `unsubscribe`).
//! Outbound text frames are `{channel, payload}` objects. Closing the socket
//! disconnects the transport connection, which disposes its subscriptions.

use std::sync::Arc;

use axum::{
    extract::{
        Extension,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use tether_core::TetherError;
use tether_infra::transport::protocol::{channels, request_error_payload};
use tether_infra::transport::{ClientMessage, ConnectionHandle, OutboundFrame, Transport};

use crate::app::services::AppServices;

pub async fn connect(
    ws: WebSocketUpgrade,
    Extension(services): Extension<Arc<AppServices>>,
) -> Response {
    ws.on_upgrade(move |socket| session(socket, services))
}

fn encode(frame: &OutboundFrame) -> Option<Message> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(Message::Text(text)),
        Err(err) => {
            warn!(channel = %frame.channel, error = %err, "unserialisable outbound frame dropped");
            None
        }
    }
}

async fn session(socket: WebSocket, services: Arc<AppServices>) {
    let ConnectionHandle { id, outbound } = services.transport.connect();
    info!(connection_id = %id, "websocket session opened");

    let (mut sink, mut inbound) = socket.split();

    let writer = tokio::spawn(async move {
        let mut frames = UnboundedReceiverStream::new(outbound);
        while let Some(frame) = frames.next().await {
            let Some(message) = encode(&frame) else {
                continue;
            };
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = inbound.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(err) => {
                debug!(connection_id = %id, error = %err, "websocket read failed");
                break;
            }
        };

        match ClientMessage::parse(&text) {
            Ok(message) => {
                if services.transport.deliver(id, message).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let err = TetherError::from(err);
                services
                    .transport
                    .push(id, channels::SUBSCRIPTION, request_error_payload(None, &err));
            }
        }
    }

    // Drops the outbound sender, which ends the writer.
    services.transport.disconnect(id);
    let _ = writer.await;
    info!(connection_id = %id, "websocket session closed");
}
