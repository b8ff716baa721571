use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::{Config, TransferConfig};
use crate::protocol::{KvRecord, PeerId, SignalingMessage, TextMessage};
use crate::storage::RecordSink;
use crate::transport::credentials::CredentialFetcher;
use crate::transport::signaling::SignalingChannel;
use crate::transport::webrtc::WebRtcConnector;
use crate::transport::{
    InboundMessage, Payload, PeerConnectionManager, PeerConnector, SignalTransport,
    TransportError,
};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("channel to {peer} not ready after {attempts} attempts")]
    RetriesExhausted { peer: PeerId, attempts: u32 },
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Outcome of copying a record set to one peer.
#[derive(Debug)]
pub struct PeerTransferResult {
    pub peer: PeerId,
    /// Number of records delivered, or the error that stopped the copy.
    pub outcome: Result<usize, TransferError>,
}

impl PeerTransferResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }
}

pub struct TransferOrchestrator {
    manager: Arc<PeerConnectionManager>,
    signaling: Arc<dyn SignalTransport>,
    relay: Option<Arc<SignalingChannel>>,
    config: TransferConfig,
    pump: JoinHandle<()>,
}

impl TransferOrchestrator {
    /// Wires an orchestrator from already-built collaborators and starts
    /// pumping `inbound` signaling into the manager.
    pub fn new(
        manager: Arc<PeerConnectionManager>,
        signaling: Arc<dyn SignalTransport>,
        mut inbound: mpsc::UnboundedReceiver<SignalingMessage>,
        config: TransferConfig,
    ) -> Self {
        let pump_manager = Arc::clone(&manager);
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump_manager.handle_signal(message).await;
            }
            debug!(target: "dbase::transfer", "signaling pump stopped");
        });
        Self {
            manager,
            signaling,
            relay: None,
            config,
            pump,
        }
    }

    /// Connects to the relay, resolves ICE servers and builds the WebRTC stack.
    pub async fn start(
        config: &Config,
        local_id: PeerId,
        sink: Arc<dyn RecordSink>,
    ) -> Result<Self, TransportError> {
        let (relay, inbound) =
            SignalingChannel::connect(&config.relay_url, local_id.clone(), config.signaling)?;
        let ice_servers = CredentialFetcher::new(config.credentials_url.clone())?
            .ice_servers()
            .await;
        let connector: Arc<dyn PeerConnector> =
            Arc::new(WebRtcConnector::new(ice_servers, config.transfer)?);
        let signaling: Arc<dyn SignalTransport> = relay.clone();
        let manager = Arc::new(PeerConnectionManager::new(
            local_id.clone(),
            connector,
            Arc::clone(&signaling),
            sink,
            config.chunk,
        ));

        if !signaling.wait_connected(config.signaling.connect_timeout).await {
            warn!(
                target: "dbase::transfer",
                relay = %relay.url(),
                "relay not reachable yet; continuing in background"
            );
        }
        info!(target: "dbase::transfer", peer_id = %local_id, "node started");

        let mut orchestrator = Self::new(manager, signaling, inbound, config.transfer);
        orchestrator.relay = Some(relay);
        Ok(orchestrator)
    }

    pub fn manager(&self) -> &Arc<PeerConnectionManager> {
        &self.manager
    }

    pub fn local_id(&self) -> &PeerId {
        self.manager.local_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.manager.subscribe()
    }

    /// True while any peer is connected.
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.manager.ready_watch()
    }

    pub fn signaling_connected(&self) -> bool {
        self.signaling.is_connected()
    }

    /// Sends at once when the channel is open. Otherwise makes exactly
    /// `retries` attempts, each one ensuring signaling, starting connection
    /// setup and polling for the channel to open. A channel lost mid-send
    /// costs one attempt; the next one resends the whole payload.
    pub async fn send_payload(
        &self,
        peer: &PeerId,
        payload: Payload,
        retries: u32,
    ) -> Result<usize, TransferError> {
        if self.manager.is_ready(peer).await {
            match self.manager.send(peer, &payload).await {
                Ok(frames) => return Ok(frames),
                Err(err) if err.is_channel_failure() => {
                    debug!(target: "dbase::transfer", peer = %peer, error = %err, "open channel failed; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }

        let signaling_wait = self.config.open_poll_interval * self.config.open_poll_attempts;
        for attempt in 1..=retries {
            if !self.signaling.is_connected() && !self.signaling.wait_connected(signaling_wait).await {
                warn!(
                    target: "dbase::transfer",
                    peer = %peer,
                    attempt,
                    "signaling not connected"
                );
                continue;
            }

            let setup = if attempt == 1 {
                self.manager.connect(peer).await
            } else {
                self.manager.redial(peer).await
            };
            if let Err(err) = setup {
                warn!(
                    target: "dbase::transfer",
                    peer = %peer,
                    attempt,
                    error = %err,
                    "connection setup failed"
                );
                continue;
            }

            if self.poll_open(peer).await {
                match self.manager.send(peer, &payload).await {
                    Ok(frames) => {
                        debug!(target: "dbase::transfer", peer = %peer, attempt, frames, "payload delivered");
                        return Ok(frames);
                    }
                    Err(err) if err.is_channel_failure() => {
                        warn!(
                            target: "dbase::transfer",
                            peer = %peer,
                            attempt,
                            error = %err,
                            "send interrupted"
                        );
                        continue;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            warn!(
                target: "dbase::transfer",
                peer = %peer,
                attempt,
                retries,
                "data channel not open"
            );
        }

        Err(TransferError::RetriesExhausted {
            peer: peer.clone(),
            attempts: retries,
        })
    }

    async fn poll_open(&self, peer: &PeerId) -> bool {
        for _ in 0..self.config.open_poll_attempts {
            sleep(self.config.open_poll_interval).await;
            if self.manager.is_ready(peer).await {
                return true;
            }
        }
        false
    }

    pub async fn send_record(&self, peer: &PeerId, record: KvRecord) -> Result<usize, TransferError> {
        self.send_payload(peer, Payload::Record(record), self.config.retries)
            .await
    }

    pub async fn send_text(
        &self,
        peer: &PeerId,
        content: impl Into<String>,
    ) -> Result<(), TransferError> {
        self.send_payload(peer, Payload::Text(TextMessage::new(content)), self.config.retries)
            .await
            .map(|_| ())
    }

    /// Copies every record to every peer. Peers run concurrently and fail
    /// independently; records for one peer go in order and stop at the first
    /// error.
    pub async fn copy_to_peers(
        &self,
        peers: &[PeerId],
        records: &[KvRecord],
    ) -> Vec<PeerTransferResult> {
        let jobs = peers.iter().map(|peer| async move {
            let mut delivered = 0usize;
            for record in records {
                if let Err(err) = self.send_record(peer, record.clone()).await {
                    warn!(
                        target: "dbase::transfer",
                        peer = %peer,
                        key = %record.key,
                        delivered,
                        error = %err,
                        "copy to peer failed"
                    );
                    return PeerTransferResult {
                        peer: peer.clone(),
                        outcome: Err(err),
                    };
                }
                delivered += 1;
            }
            info!(target: "dbase::transfer", peer = %peer, delivered, "copy to peer finished");
            PeerTransferResult {
                peer: peer.clone(),
                outcome: Ok(delivered),
            }
        });
        join_all(jobs).await
    }

    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        if let Some(relay) = &self.relay {
            relay.shutdown();
        }
        self.pump.abort();
    }
}

impl Drop for TransferOrchestrator {
    fn drop(&mut self) {
        self.pump.abort();
    }
}
