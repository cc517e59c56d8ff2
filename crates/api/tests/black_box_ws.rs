use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tether_api::app::{AppServices, build_app};
use tether_core::{CollectionSchema, FieldDecl, FieldType, Filter, Schema};
use tether_infra::TetherConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    base_url: String,
    ws_url: String,
    services: Arc<AppServices>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn() -> Self {
        let schema = Schema::new()
            .with_collection(
                CollectionSchema::new("users")
                    .field(FieldDecl::new("firstName", FieldType::String))
                    .field(FieldDecl::link_many("groups", "groups", "members")),
            )
            .with_collection(
                CollectionSchema::new("groups")
                    .field(FieldDecl::new("name", FieldType::String))
                    .field(FieldDecl::link_many("members", "users", "groups")),
            );
        let services = Arc::new(
            AppServices::build(&TetherConfig::default(), schema)
                .await
                .expect("failed to wire services"),
        );

        // Same router as prod, bound to an ephemeral port.
        let app = build_app(services.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            ws_url: format!("ws://{addr}/ws"),
            services,
            handle,
        }
    }

    async fn socket(&self) -> Socket {
        let (socket, _) = connect_async(self.ws_url.as_str())
            .await
            .expect("websocket handshake failed");
        socket
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn send(socket: &mut Socket, message: Value) {
    socket.send(Message::Text(message.to_string())).await.unwrap();
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), socket.next())
            .await
            .expect("no frame within timeout")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn health_reports_ok() {
    let server = TestServer::spawn().await;

    let res = reqwest::get(format!("{}/health", server.base_url)).await.unwrap();
    assert_eq!(res.status(), reqwest::StatusCode::OK);
    let body: Value = res.json().await.unwrap();
    assert_eq!(body["status"], json!("ok"));
    assert_eq!(body["subscriptions"], json!(0));
}

#[tokio::test]
async fn subscriber_receives_snapshots_over_websocket() {
    let server = TestServer::spawn().await;
    let mut socket = server.socket().await;

    send(
        &mut socket,
        json!({ "type": "subscribe", "requestId": "r1", "kind": "query", "collection": "users", "filter": {} }),
    )
    .await;

    let ack = next_frame(&mut socket).await;
    assert_eq!(ack["channel"], json!("subscription"));
    assert_eq!(ack["payload"]["requestId"], json!("r1"));
    let subscription_id = ack["payload"]["subscriptionId"].clone();

    let initial = next_frame(&mut socket).await;
    assert_eq!(initial["channel"], json!("snapshot"));
    assert_eq!(initial["payload"]["data"], json!([]));

    let user = server
        .services
        .store
        .create("users", serde_json::from_value(json!({ "firstName": "Ada" })).unwrap())
        .await
        .unwrap()
        .value;

    let pushed = next_frame(&mut socket).await;
    assert_eq!(pushed["payload"]["subscriptionId"], subscription_id);
    assert_eq!(pushed["payload"]["data"][0]["uid"], json!(user.uid.as_str()));

    server
        .services
        .store
        .delete("users", &Filter::uid(&user.uid))
        .await
        .unwrap();
    let emptied = next_frame(&mut socket).await;
    assert_eq!(emptied["payload"]["data"], json!([]));
}

#[tokio::test]
async fn malformed_and_invalid_requests_are_answered() {
    let server = TestServer::spawn().await;
    let mut socket = server.socket().await;

    socket.send(Message::Text("not json".to_string())).await.unwrap();
    let malformed = next_frame(&mut socket).await;
    assert_eq!(malformed["channel"], json!("subscription"));
    assert_eq!(malformed["payload"]["success"], json!(false));

    send(
        &mut socket,
        json!({ "type": "subscribe", "requestId": "r2", "kind": "query", "collection": "nope" }),
    )
    .await;
    let rejected = next_frame(&mut socket).await;
    assert_eq!(rejected["payload"]["requestId"], json!("r2"));
    assert_eq!(rejected["payload"]["error"]["name"], json!("NotFoundFailure"));
}

#[tokio::test]
async fn closing_the_socket_disposes_its_subscriptions() {
    let server = TestServer::spawn().await;
    let mut socket = server.socket().await;

    send(
        &mut socket,
        json!({ "type": "subscribe", "kind": "query", "collection": "groups" }),
    )
    .await;
    next_frame(&mut socket).await;
    next_frame(&mut socket).await;
    assert_eq!(server.services.registry.subscription_count(), 1);

    socket.close(None).await.unwrap();
    drop(socket);

    let services = server.services.clone();
    eventually(move || services.registry.subscription_count() == 0).await;
    assert_eq!(server.services.transport.connection_count(), 0);
}
