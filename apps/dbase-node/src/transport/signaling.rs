use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, interval_at, sleep, timeout};
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

use super::{SignalTransport, TransportError};
use crate::config::SignalingConfig;
use crate::protocol::{PeerId, SignalingMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum ConnectionEnd {
    Cancelled,
    Closed(String),
}

/// Persistent relay connection for one local peer id.
///
/// A supervisor task owns the websocket. It reconnects after unexpected
/// closes, gives up after `max_reconnect_attempts` consecutive failures and
/// stops as soon as `shutdown` is called.
pub struct SignalingChannel {
    peer_id: PeerId,
    url: Url,
    send_tx: mpsc::UnboundedSender<SignalingMessage>,
    connected: watch::Receiver<bool>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Starts the supervisor and returns the inbound negotiation queue. Must be
    /// called from within a tokio runtime.
    pub fn connect(
        relay_url: &str,
        peer_id: PeerId,
        config: SignalingConfig,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<SignalingMessage>), TransportError> {
        let url = derive_websocket_url(relay_url, &peer_id)?;
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected) = watch::channel(false);
        let cancel = CancellationToken::new();

        let supervisor = tokio::spawn(supervise(
            url.clone(),
            config,
            cancel.clone(),
            send_rx,
            inbound_tx,
            connected_tx,
        ));

        let channel = Arc::new(Self {
            peer_id,
            url,
            send_tx,
            connected,
            cancel,
            tasks: Mutex::new(vec![supervisor]),
        });
        Ok((channel, inbound_rx))
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn connectivity(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn send(&self, message: SignalingMessage) -> Result<(), TransportError> {
        if !*self.connected.borrow() {
            warn!(
                target: "dbase::signaling",
                kind = message.kind(),
                target_peer = ?message.target_id(),
                "signaling not connected; dropping message"
            );
            return Err(TransportError::SignalingClosed);
        }
        self.send_tx
            .send(message)
            .map_err(|_| TransportError::SignalingClosed)
    }
}

#[async_trait]
impl SignalTransport for SignalingChannel {
    async fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
        self.send(message)
    }

    fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.connected.clone();
        matches!(timeout(limit, rx.wait_for(|up| *up)).await, Ok(Ok(_)))
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }
}

async fn supervise(
    url: Url,
    config: SignalingConfig,
    cancel: CancellationToken,
    mut send_rx: mpsc::UnboundedReceiver<SignalingMessage>,
    inbound_tx: mpsc::UnboundedSender<SignalingMessage>,
    connected_tx: watch::Sender<bool>,
) {
    let mut failures: u32 = 0;
    loop {
        let attempt = tokio::select! {
            _ = cancel.cancelled() => break,
            result = timeout(config.connect_timeout, connect_async(url.as_str())) => result,
        };

        match attempt {
            Ok(Ok((ws, _))) => {
                failures = 0;
                let mut stale = 0usize;
                while send_rx.try_recv().is_ok() {
                    stale += 1;
                }
                if stale > 0 {
                    debug!(target: "dbase::signaling", stale, "discarded messages queued while offline");
                }
                info!(target: "dbase::signaling", url = %url, "signaling connected");
                connected_tx.send_replace(true);
                let end = run_connection(ws, &config, &cancel, &mut send_rx, &inbound_tx).await;
                connected_tx.send_replace(false);
                match end {
                    ConnectionEnd::Cancelled => break,
                    ConnectionEnd::Closed(reason) => {
                        warn!(target: "dbase::signaling", %reason, "signaling connection lost");
                    }
                }
            }
            Ok(Err(err)) => {
                failures += 1;
                warn!(
                    target: "dbase::signaling",
                    url = %url,
                    attempt = failures,
                    error = %err,
                    "signaling connect failed"
                );
            }
            Err(_) => {
                failures += 1;
                warn!(
                    target: "dbase::signaling",
                    url = %url,
                    attempt = failures,
                    "signaling connect timed out"
                );
            }
        }

        if failures >= config.max_reconnect_attempts {
            error!(
                target: "dbase::signaling",
                url = %url,
                failures,
                "signaling reconnect attempts exhausted"
            );
            break;
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = sleep(config.reconnect_delay) => {}
        }
    }
    connected_tx.send_replace(false);
    debug!(target: "dbase::signaling", "signaling supervisor stopped");
}

async fn run_connection(
    ws: WsStream,
    config: &SignalingConfig,
    cancel: &CancellationToken,
    send_rx: &mut mpsc::UnboundedReceiver<SignalingMessage>,
    inbound_tx: &mpsc::UnboundedSender<SignalingMessage>,
) -> ConnectionEnd {
    let (mut write, mut read) = ws.split();
    let mut heartbeat = interval_at(
        Instant::now() + config.heartbeat_interval,
        config.heartbeat_interval,
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = write.send(Message::Close(None)).await;
                return ConnectionEnd::Cancelled;
            }
            _ = heartbeat.tick() => {
                if let Err(reason) = write_message(&mut write, &SignalingMessage::Ping).await {
                    return ConnectionEnd::Closed(reason);
                }
            }
            outbound = send_rx.recv() => {
                let Some(message) = outbound else {
                    return ConnectionEnd::Cancelled;
                };
                if let Err(reason) = write_message(&mut write, &message).await {
                    return ConnectionEnd::Closed(reason);
                }
            }
            frame = read.next() => {
                if let Some(end) = handle_frame(frame, &mut write, inbound_tx).await {
                    return end;
                }
            }
        }
    }
}

async fn handle_frame(
    frame: Option<Result<Message, WsError>>,
    write: &mut SplitSink<WsStream, Message>,
    inbound_tx: &mpsc::UnboundedSender<SignalingMessage>,
) -> Option<ConnectionEnd> {
    let text = match frame {
        Some(Ok(Message::Text(text))) => text,
        Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
            Ok(text) => text,
            Err(_) => {
                warn!(target: "dbase::signaling", "ignoring non-utf8 binary frame");
                return None;
            }
        },
        Some(Ok(Message::Close(_))) | None => {
            return Some(ConnectionEnd::Closed("closed by relay".into()));
        }
        Some(Ok(_)) => return None,
        Some(Err(err)) => {
            match &err {
                WsError::ConnectionClosed
                | WsError::AlreadyClosed
                | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                    debug!(target: "dbase::signaling", "signaling websocket closed: {err}");
                }
                _ => {
                    warn!(target: "dbase::signaling", "signaling websocket error: {err}");
                }
            }
            return Some(ConnectionEnd::Closed(err.to_string()));
        }
    };

    trace!(target: "dbase::signaling", event = "ws_in", len = text.len());
    match SignalingMessage::decode(&text) {
        Ok(SignalingMessage::Ping) => {
            if let Err(reason) = write_message(write, &SignalingMessage::Pong).await {
                return Some(ConnectionEnd::Closed(reason));
            }
        }
        Ok(SignalingMessage::Pong) => {
            debug!(target: "dbase::signaling", "pong");
        }
        Ok(message) => {
            if inbound_tx.send(message).is_err() {
                debug!(target: "dbase::signaling", "inbound queue dropped");
            }
        }
        Err(err) => {
            warn!(target: "dbase::signaling", error = %err, "ignoring signaling message");
        }
    }
    None
}

async fn write_message(
    write: &mut SplitSink<WsStream, Message>,
    message: &SignalingMessage,
) -> Result<(), String> {
    let text = match message.encode() {
        Ok(text) => text,
        Err(err) => {
            warn!(target: "dbase::signaling", error = %err, "failed to encode signaling message");
            return Ok(());
        }
    };
    trace!(target: "dbase::signaling", event = "ws_out", kind = message.kind(), len = text.len());
    write
        .send(Message::Text(text))
        .await
        .map_err(|err| err.to_string())
}

pub fn derive_websocket_url(relay_url: &str, peer_id: &PeerId) -> Result<Url, TransportError> {
    let base = Url::parse(relay_url)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {relay_url}: {err}")))?;
    let scheme = match base.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(TransportError::Setup(format!(
                "unsupported relay url scheme {other}"
            )));
        }
    };
    let mut ws = base.clone();
    ws.set_scheme(scheme)
        .map_err(|_| TransportError::Setup("invalid websocket scheme".into()))?;
    let prefix = base.path().trim_end_matches('/');
    ws.set_path(&format!("{prefix}/ws/{}", peer_id.as_str()));
    ws.set_query(None);
    ws.set_fragment(None);
    Ok(ws)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_from_relay_base() {
        let peer = PeerId::from("node-a");
        assert_eq!(
            derive_websocket_url("https://relay.example", &peer).unwrap().as_str(),
            "wss://relay.example/ws/node-a"
        );
        assert_eq!(
            derive_websocket_url("ws://127.0.0.1:8000/", &peer).unwrap().as_str(),
            "ws://127.0.0.1:8000/ws/node-a"
        );
        assert_eq!(
            derive_websocket_url("http://host/relay?x=1", &peer).unwrap().as_str(),
            "ws://host/relay/ws/node-a"
        );
        assert!(derive_websocket_url("ftp://host", &peer).is_err());
    }

    #[tokio::test]
    async fn send_without_connection_is_rejected() {
        let config = SignalingConfig {
            max_reconnect_attempts: 1,
            connect_timeout: Duration::from_millis(200),
            ..SignalingConfig::default()
        };
        let (channel, _inbound) =
            SignalingChannel::connect("ws://127.0.0.1:9", PeerId::from("a"), config).unwrap();
        let err = channel
            .send(SignalingMessage::Ping)
            .expect_err("not connected");
        assert!(matches!(err, TransportError::SignalingClosed));
        assert!(!channel.wait_connected(Duration::from_millis(300)).await);
        channel.shutdown();
    }
}
