use anyhow::{Result, bail};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use lib_common::core::BroadcastHub;
use lib_common::feeds::ScriptedFeed;
use project_tests::{WAIT, insert};
use serde_json::{Value, json};
use servers::watch_logic::config::{Config, Settings};
use servers::watch_logic::state::{AppState, Catalog};
use servers::watch_logic::{downstream, upstream};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct StaticCatalog;

#[async_trait]
impl Catalog for StaticCatalog {
    async fn containers(&self) -> Result<Vec<String>> {
        Ok(vec!["billing".into(), "orders".into()])
    }

    async fn resources(&self, container: &str) -> Result<Vec<String>> {
        match container {
            "orders" => Ok(vec!["items".into(), "returns".into()]),
            other => bail!("no such container {other}"),
        }
    }
}

struct Relay {
    addr: SocketAddr,
    feed: ScriptedFeed,
    shutdown: CancellationToken,
}

async fn start_relay(config: Config) -> Relay {
    let base = Config {
        retry_delay_ms: Some(10),
        open_timeout_ms: Some(500),
        ..Default::default()
    };
    let settings = Settings::resolve(base.merge(config)).unwrap();

    let feed = ScriptedFeed::new();
    let hub = Arc::new(BroadcastHub::new(settings.viewer_queue, settings.locked));
    let shutdown = CancellationToken::new();
    let (session, _task) = upstream::spawn(feed.clone(), Arc::clone(&hub), &settings, shutdown.clone());

    let state = AppState::new(hub, session, Arc::new(StaticCatalog), settings);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(downstream::serve(listener, downstream::router(state), shutdown.clone()));

    Relay { addr, feed, shutdown }
}

async fn connect(relay: &Relay) -> Socket {
    let (socket, _) = connect_async(format!("ws://{}/ws", relay.addr)).await.unwrap();
    socket
}

async fn next_json(socket: &mut Socket) -> Value {
    loop {
        let frame = timeout(WAIT, socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .unwrap();
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn next_of_type(socket: &mut Socket, kind: &str) -> Value {
    loop {
        let value = next_json(socket).await;
        if value["type"] == kind {
            return value;
        }
    }
}

async fn quiet(socket: &mut Socket) -> bool {
    timeout(Duration::from_millis(150), socket.next()).await.is_err()
}

async fn send(socket: &mut Socket, value: Value) {
    socket.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn http_get(addr: SocketAddr, path: &str) -> (u16, Value) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = String::new();
    timeout(WAIT, stream.read_to_string(&mut raw)).await.unwrap().unwrap();
    let status: u16 = raw.split_whitespace().nth(1).unwrap().parse().unwrap();
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b).unwrap_or_default();
    (status, serde_json::from_str(body).unwrap_or(Value::Null))
}

#[tokio::test]
async fn test_viewer_is_greeted_with_welcome_and_status() {
    let relay = start_relay(Config { fixed_container: Some("orders".into()), ..Default::default() }).await;
    let mut viewer = connect(&relay).await;

    assert_eq!(next_json(&mut viewer).await["type"], "welcome");
    let status = next_of_type(&mut viewer, "status").await;
    assert_eq!(status["watching"], "orders.*");

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_change_frames_carry_rendered_payload() {
    let relay = start_relay(Config { fixed_container: Some("orders".into()), ..Default::default() }).await;
    let mut viewer = connect(&relay).await;
    next_of_type(&mut viewer, "status").await;

    assert!(relay.feed.emit(insert("orders", "items", bson::doc! { "a": 1, "b": "x" })));
    let change = next_of_type(&mut viewer, "change").await;

    assert_eq!(change["operation"], "INSERT");
    assert_eq!(change["namespace"], "orders.items");
    assert_eq!(change["renderedStructured"], json!({ "a": 1, "b": "x" }));
    let keys: Vec<&String> = change["renderedStructured"].as_object().unwrap().keys().collect();
    assert_eq!(keys, vec!["a", "b"]);
    assert_eq!(change["raw"]["ns"]["coll"], "items");

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_select_target_status_reaches_every_viewer() {
    let relay = start_relay(Config::default()).await;
    let mut a = connect(&relay).await;
    let mut b = connect(&relay).await;
    assert_eq!(next_of_type(&mut a, "status").await["watching"], "entire deployment");
    assert_eq!(next_of_type(&mut b, "status").await["watching"], "entire deployment");

    send(&mut a, json!({ "type": "selectTarget", "db": "orders", "collection": "items" })).await;

    let status_a = next_of_type(&mut a, "status").await;
    let status_b = next_of_type(&mut b, "status").await;
    assert_eq!(status_a["watching"], "orders.items");
    assert_eq!(status_a, status_b);

    let (code, health) = http_get(relay.addr, "/health").await;
    assert_eq!(code, 200);
    assert_eq!(health["session"]["target"], "orders.items");
    assert_eq!(health["session"]["phase"], "watching");
    assert_eq!(health["viewers"], 2);

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_malformed_request_is_answered_to_sender_only() {
    let relay = start_relay(Config::default()).await;
    let mut sender = connect(&relay).await;
    let mut other = connect(&relay).await;
    next_of_type(&mut sender, "status").await;
    next_of_type(&mut other, "status").await;

    sender.send(Message::Text("{ definitely not json".to_string().into())).await.unwrap();
    let error = next_json(&mut sender).await;
    assert_eq!(error["type"], "error");
    assert!(error["message"].as_str().unwrap().contains("malformed"));
    assert!(quiet(&mut other).await);

    // The connection stays usable.
    send(&mut sender, json!({ "type": "selectTarget", "container": "orders", "resource": "*" })).await;
    assert_eq!(next_of_type(&mut sender, "status").await["watching"], "orders.*");

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_locked_relay_refuses_select_target() {
    let relay = start_relay(Config {
        fixed_container: Some("orders".into()),
        fixed_resource: Some("items".into()),
        ..Default::default()
    })
    .await;
    let mut requester = connect(&relay).await;
    let mut bystander = connect(&relay).await;
    next_of_type(&mut requester, "status").await;
    next_of_type(&mut bystander, "status").await;

    send(&mut requester, json!({ "type": "selectTarget", "container": "billing" })).await;
    let error = next_json(&mut requester).await;
    assert_eq!(error["type"], "error");
    assert!(quiet(&mut bystander).await);

    let (_, config) = http_get(relay.addr, "/api/config").await;
    assert_eq!(config["locked"], true);
    assert_eq!(config["fixedContainer"], "orders");
    assert_eq!(config["fixedResource"], "items");
    assert_eq!(config["watching"], "orders.items");

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_discovery_endpoints() {
    let relay = start_relay(Config::default()).await;

    let (code, containers) = http_get(relay.addr, "/api/containers").await;
    assert_eq!(code, 200);
    assert_eq!(containers["containers"], json!(["billing", "orders"]));

    let (code, resources) = http_get(relay.addr, "/api/containers/orders/resources").await;
    assert_eq!(code, 200);
    assert_eq!(resources, json!({ "container": "orders", "resources": ["items", "returns"] }));

    let (code, missing) = http_get(relay.addr, "/api/containers/nope/resources").await;
    assert_eq!(code, 502);
    assert!(missing["error"].as_str().unwrap().contains("nope"));

    relay.shutdown.cancel();
}

#[tokio::test]
async fn test_shutdown_closes_viewer_sockets() {
    let relay = start_relay(Config::default()).await;
    let mut viewer = connect(&relay).await;
    next_of_type(&mut viewer, "status").await;

    relay.shutdown.cancel();

    let closed = timeout(WAIT, async {
        loop {
            match viewer.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok());
}
