use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::{IceCandidate, PeerId, SessionDescription, SignalingMessage};

pub mod chunk;
pub mod credentials;
pub mod manager;
pub mod mock;
pub mod payload;
pub mod session;
pub mod signaling;
pub mod webrtc;

pub use chunk::{ChunkConfig, ChunkError};
pub use manager::{InboundMessage, PeerConnectionManager};
pub use payload::Payload;
pub use session::SessionState;

/// Label of the data channel both ends open for transfers.
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("signaling channel is not connected")]
    SignalingClosed,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("data channel to {0} is not open")]
    ChannelNotOpen(PeerId),
    #[error("operation timed out")]
    Timeout,
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error(transparent)]
    Chunk(#[from] ChunkError),
    #[error("payload codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    /// The data channel went away; a fresh session may get the payload through.
    pub fn is_channel_failure(&self) -> bool {
        matches!(
            self,
            TransportError::ChannelNotOpen(_) | TransportError::ChannelClosed | TransportError::Timeout
        )
    }
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

/// Identifies one incarnation of a peer session.
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    Checking,
    Connected,
    Disconnected,
    Failed,
    Closed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    LocalCandidate(IceCandidate),
    ChannelOpen,
    ChannelClosed,
    IceState(IceState),
    Message(Bytes),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedLinkEvent {
    pub peer: PeerId,
    pub generation: Generation,
    pub event: LinkEvent,
}

/// Handle a link uses to report events back to the manager's dispatch task.
#[derive(Debug, Clone)]
pub struct LinkEventSink {
    peer: PeerId,
    generation: Generation,
    tx: mpsc::UnboundedSender<TaggedLinkEvent>,
}

impl LinkEventSink {
    pub fn new(
        peer: PeerId,
        generation: Generation,
        tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    ) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the manager is gone.
    pub fn emit(&self, event: LinkEvent) -> bool {
        self.tx
            .send(TaggedLinkEvent {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One negotiated (or negotiating) connection to a remote peer.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_data_channel(&self) -> Result<(), TransportError>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Creates an answer and installs it as the local description.
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    /// Sends one frame, waiting for the channel buffer to drain first.
    async fn send(&self, frame: Bytes) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Detaches event handlers and releases the connection.
    async fn close(&self);
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn connect(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError>;
}

/// Outbound half of the relay connection.
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Waits until the relay connection is up. Returns false on timeout.
    async fn wait_connected(&self, timeout: Duration) -> bool;
}
