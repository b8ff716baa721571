use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{
    Path, State,
    ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
};
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio::time::{sleep, timeout};

use dbase_node::config::SignalingConfig;
use dbase_node::protocol::{PeerId, SessionDescription, SignalingMessage};
use dbase_node::transport::signaling::SignalingChannel;
use dbase_node::transport::{SignalTransport, TransportError};

#[derive(Clone, Default)]
struct Relay {
    peers: Arc<AsyncMutex<HashMap<String, mpsc::UnboundedSender<WsMessage>>>>,
    received: Arc<AsyncMutex<Vec<(String, Value)>>>,
    joins: Arc<AsyncMutex<Vec<String>>>,
}

impl Relay {
    async fn received_types(&self, peer: &str) -> Vec<String> {
        self.received
            .lock()
            .await
            .iter()
            .filter(|(from, _)| from == peer)
            .filter_map(|(_, value)| value.get("type").and_then(Value::as_str).map(str::to_owned))
            .collect()
    }

    async fn join_count(&self, peer: &str) -> usize {
        self.joins.lock().await.iter().filter(|id| *id == peer).count()
    }

    async fn push(&self, peer: &str, text: &str) -> bool {
        match self.peers.lock().await.get(peer) {
            Some(tx) => tx.send(WsMessage::Text(text.to_owned())).is_ok(),
            None => false,
        }
    }

    async fn kick(&self, peer: &str) {
        if let Some(tx) = self.peers.lock().await.remove(peer) {
            let _ = tx.send(WsMessage::Close(None));
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(relay): State<Relay>,
    Path(peer): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, relay, peer))
}

async fn handle_socket(socket: WebSocket, relay: Relay, peer: String) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    relay.peers.lock().await.insert(peer.clone(), tx);
    relay.joins.lock().await.push(peer.clone());

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, WsMessage::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let WsMessage::Text(text) = message else {
            continue;
        };
        let Ok(mut value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        relay.received.lock().await.push((peer.clone(), value.clone()));
        let Some(target) = value.get("target_id").and_then(Value::as_str).map(str::to_owned)
        else {
            continue;
        };
        value["source_id"] = Value::String(peer.clone());
        if let Some(tx) = relay.peers.lock().await.get(&target) {
            let _ = tx.send(WsMessage::Text(value.to_string()));
        }
    }
    send_task.abort();
}

async fn spawn_relay() -> (Relay, SocketAddr) {
    let relay = Relay::default();
    let router = Router::new()
        .route("/ws/:id", get(ws_handler))
        .with_state(relay.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("listener bind");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });
    (relay, addr)
}

fn fast_config() -> SignalingConfig {
    SignalingConfig {
        heartbeat_interval: Duration::from_millis(100),
        reconnect_delay: Duration::from_millis(50),
        max_reconnect_attempts: 5,
        connect_timeout: Duration::from_secs(2),
    }
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::test]
async fn routes_offer_between_peers_with_source_stamped() {
    let (_relay, addr) = spawn_relay().await;
    let url = format!("http://{addr}");
    let (alice, _alice_rx) =
        SignalingChannel::connect(&url, PeerId::from("alice"), fast_config()).unwrap();
    let (bob, mut bob_rx) =
        SignalingChannel::connect(&url, PeerId::from("bob"), fast_config()).unwrap();
    assert!(alice.wait_connected(Duration::from_secs(5)).await);
    assert!(bob.wait_connected(Duration::from_secs(5)).await);

    alice
        .send_signal(SignalingMessage::offer_to(
            PeerId::from("bob"),
            SessionDescription::offer("v=0\r\n"),
        ))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), bob_rx.recv())
        .await
        .expect("offer routed")
        .expect("queue open");
    match received {
        SignalingMessage::Offer { route, description } => {
            assert_eq!(route.source_id, Some(PeerId::from("alice")));
            assert_eq!(description.sdp, "v=0\r\n");
        }
        other => panic!("expected offer, got {other:?}"),
    }
}

#[tokio::test]
async fn heartbeat_pings_and_answers_relay_pings() {
    let (relay, addr) = spawn_relay().await;
    let (channel, _rx) =
        SignalingChannel::connect(&format!("ws://{addr}"), PeerId::from("carol"), fast_config())
            .unwrap();
    assert!(channel.wait_connected(Duration::from_secs(5)).await);

    assert!(
        eventually(|| async { relay.received_types("carol").await.iter().any(|t| t == "ping") })
            .await
    );

    assert!(relay.push("carol", r#"{"type":"ping"}"#).await);
    assert!(
        eventually(|| async { relay.received_types("carol").await.iter().any(|t| t == "pong") })
            .await
    );
}

#[tokio::test]
async fn reconnects_after_relay_drops_the_socket() {
    let (relay, addr) = spawn_relay().await;
    let (channel, _rx) =
        SignalingChannel::connect(&format!("ws://{addr}"), PeerId::from("dave"), fast_config())
            .unwrap();
    assert!(channel.wait_connected(Duration::from_secs(5)).await);
    assert_eq!(relay.join_count("dave").await, 1);

    relay.kick("dave").await;
    assert!(eventually(|| async { relay.join_count("dave").await >= 2 }).await);
    assert!(channel.wait_connected(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn unreachable_relay_gives_up_and_rejects_sends() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let config = SignalingConfig {
        max_reconnect_attempts: 2,
        reconnect_delay: Duration::from_millis(10),
        ..fast_config()
    };
    let (channel, mut rx) =
        SignalingChannel::connect(&format!("ws://{addr}"), PeerId::from("erin"), config).unwrap();
    assert!(!channel.wait_connected(Duration::from_millis(300)).await);

    let err = channel
        .send_signal(SignalingMessage::offer_to(
            PeerId::from("frank"),
            SessionDescription::offer("v=0"),
        ))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::SignalingClosed));
    // supervisor exits, dropping the inbound sender
    assert!(timeout(Duration::from_secs(2), rx.recv()).await.unwrap().is_none());
}

#[tokio::test]
async fn shutdown_disconnects() {
    let (_relay, addr) = spawn_relay().await;
    let (channel, _rx) =
        SignalingChannel::connect(&format!("ws://{addr}"), PeerId::from("gina"), fast_config())
            .unwrap();
    assert!(channel.wait_connected(Duration::from_secs(5)).await);

    let mut connectivity = channel.connectivity();
    channel.shutdown();
    let down = timeout(Duration::from_secs(2), connectivity.wait_for(|up| !*up)).await;
    assert!(matches!(down, Ok(Ok(_))));
    assert!(!channel.is_connected());
}
