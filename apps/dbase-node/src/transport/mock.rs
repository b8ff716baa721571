//! In-memory stand-ins for the WebRTC stack and the relay.
//!
//! `MockNetwork` pairs links by `(local, remote)` peer ids. A link opens its
//! channel once it and its partner both hold local and remote descriptions.
//! `MemoryRelay` routes signaling messages between in-process peers through
//! queues, stamping `source_id` the way the relay does.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    IceState, LinkEvent, LinkEventSink, PeerConnector, PeerLink, SignalTransport, TransportError,
};
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription, SignalingMessage};

#[derive(Default)]
struct NetworkState {
    links: HashMap<(PeerId, PeerId), Weak<MockLink>>,
    never_open: HashSet<PeerId>,
    drop_after: HashMap<PeerId, usize>,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self, local: impl Into<PeerId>) -> Arc<MockConnector> {
        Arc::new(MockConnector {
            local: local.into(),
            network: self.clone(),
            connects: AtomicUsize::new(0),
            links: Mutex::new(Vec::new()),
        })
    }

    /// Links created towards or from `peer` never open their channel.
    pub fn never_open(&self, peer: impl Into<PeerId>) {
        self.state.lock().never_open.insert(peer.into());
    }

    /// The next link sending to `peer` loses its channel after `frames`
    /// frames have gone through. Fires once.
    pub fn drop_after(&self, peer: impl Into<PeerId>, frames: usize) {
        self.state.lock().drop_after.insert(peer.into(), frames);
    }

    fn should_drop(&self, remote: &PeerId) -> bool {
        let mut state = self.state.lock();
        let Some(remaining) = state.drop_after.get_mut(remote) else {
            return false;
        };
        if *remaining > 0 {
            *remaining -= 1;
            return false;
        }
        state.drop_after.remove(remote);
        true
    }

    fn register(&self, link: &Arc<MockLink>) {
        self.state.lock().links.insert(
            (link.local.clone(), link.remote.clone()),
            Arc::downgrade(link),
        );
    }

    fn blocked(&self, a: &PeerId, b: &PeerId) -> bool {
        let state = self.state.lock();
        state.never_open.contains(a) || state.never_open.contains(b)
    }

    fn counterpart(&self, link: &MockLink) -> Option<Arc<MockLink>> {
        self.state
            .lock()
            .links
            .get(&(link.remote.clone(), link.local.clone()))
            .and_then(Weak::upgrade)
    }
}

pub struct MockConnector {
    local: PeerId,
    network: MockNetwork,
    connects: AtomicUsize,
    links: Mutex<Vec<Arc<MockLink>>>,
}

impl MockConnector {
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Every link this connector created for `peer`, oldest first.
    pub fn links_to(&self, peer: &PeerId) -> Vec<Arc<MockLink>> {
        self.links
            .lock()
            .iter()
            .filter(|link| &link.remote == peer)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let link = Arc::new(MockLink {
            local: self.local.clone(),
            remote: peer.clone(),
            network: self.network.clone(),
            events,
            state: Mutex::new(LinkState::default()),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.network.register(&link);
        self.links.lock().push(Arc::clone(&link));
        Ok(link)
    }
}

#[derive(Default)]
struct LinkState {
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    has_channel: bool,
    applied_candidates: Vec<IceCandidate>,
    sent: Vec<Bytes>,
    partner: Option<Weak<MockLink>>,
}

pub struct MockLink {
    local: PeerId,
    remote: PeerId,
    network: MockNetwork,
    events: LinkEventSink,
    state: Mutex<LinkState>,
    open: AtomicBool,
    closed: AtomicBool,
}

impl MockLink {
    pub fn generation(&self) -> u64 {
        self.events.generation()
    }

    pub fn applied_candidates(&self) -> Vec<IceCandidate> {
        self.state.lock().applied_candidates.clone()
    }

    pub fn sent_frames(&self) -> usize {
        self.state.lock().sent.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Emits an arbitrary event as if the stack had raised it.
    pub fn inject(&self, event: LinkEvent) -> bool {
        self.events.emit(event)
    }

    fn negotiated(&self) -> bool {
        let state = self.state.lock();
        state.local_description.is_some() && state.remote_description.is_some()
    }

    fn set_local(&self, kind: SdpKind) -> SessionDescription {
        let description = SessionDescription {
            kind,
            sdp: format!("v=0\r\no=- {} {} IN IP4 127.0.0.1\r\n", self.local, self.generation()),
        };
        self.state.lock().local_description = Some(description.clone());
        self.events.emit(LinkEvent::LocalCandidate(IceCandidate {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", 40000 + self.generation()),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }));
        description
    }

    fn try_open(self: &Arc<Self>) {
        if !self.negotiated() || self.network.blocked(&self.local, &self.remote) {
            return;
        }
        let Some(partner) = self.network.counterpart(self) else {
            return;
        };
        if !partner.negotiated() || partner.is_closed() {
            return;
        }
        self.state.lock().partner = Some(Arc::downgrade(&partner));
        partner.state.lock().partner = Some(Arc::downgrade(self));
        for link in [self, &partner] {
            if !link.open.swap(true, Ordering::SeqCst) {
                link.events.emit(LinkEvent::IceState(IceState::Connected));
                link.events.emit(LinkEvent::ChannelOpen);
            }
        }
    }

    fn partner(&self) -> Option<Arc<MockLink>> {
        self.state.lock().partner.as_ref().and_then(Weak::upgrade)
    }

    /// Both ends see the channel close, as when the transport underneath dies.
    fn sever(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.events.emit(LinkEvent::ChannelClosed);
        if let Some(partner) = self.partner() {
            if partner.open.swap(false, Ordering::SeqCst) {
                partner.events.emit(LinkEvent::ChannelClosed);
            }
        }
    }

    fn self_arc(&self) -> Option<Arc<MockLink>> {
        self.network
            .state
            .lock()
            .links
            .get(&(self.local.clone(), self.remote.clone()))
            .and_then(Weak::upgrade)
            .filter(|link| std::ptr::eq(Arc::as_ptr(link), self))
    }
}

#[async_trait]
impl PeerLink for MockLink {
    async fn create_data_channel(&self) -> Result<(), TransportError> {
        self.state.lock().has_channel = true;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        if !self.state.lock().has_channel {
            return Err(TransportError::Negotiation("offer without data channel".into()));
        }
        Ok(self.set_local(SdpKind::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        if self.state.lock().remote_description.is_none() {
            return Err(TransportError::Negotiation("answer before remote offer".into()));
        }
        let description = self.set_local(SdpKind::Answer);
        if let Some(me) = self.self_arc() {
            me.try_open();
        }
        Ok(description)
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        self.state.lock().remote_description = Some(description);
        if let Some(me) = self.self_arc() {
            me.try_open();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.remote_description.is_none() {
            return Err(TransportError::Negotiation(
                "candidate applied before remote description".into(),
            ));
        }
        state.applied_candidates.push(candidate);
        Ok(())
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::ChannelNotOpen(self.remote.clone()));
        }
        let partner = self.partner().ok_or(TransportError::ChannelClosed)?;
        if self.network.should_drop(&self.remote) {
            self.sever();
            return Err(TransportError::ChannelClosed);
        }
        self.state.lock().sent.push(frame.clone());
        if !partner.is_closed() {
            partner.events.emit(LinkEvent::Message(frame));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(partner) = self.partner() {
            if partner.open.swap(false, Ordering::SeqCst) {
                partner.events.emit(LinkEvent::ChannelClosed);
            }
        }
    }
}

/// Relay stand-in. Each registered peer gets an inbound queue.
#[derive(Clone, Default)]
pub struct MemoryRelay {
    peers: Arc<Mutex<HashMap<PeerId, mpsc::UnboundedSender<SignalingMessage>>>>,
    offline: Arc<Mutex<HashSet<PeerId>>>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &self,
        peer: impl Into<PeerId>,
    ) -> (Arc<MemorySignaling>, mpsc::UnboundedReceiver<SignalingMessage>) {
        let peer = peer.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(peer.clone(), tx);
        let signaling = Arc::new(MemorySignaling {
            local: peer,
            relay: self.clone(),
            sent: Mutex::new(Vec::new()),
        });
        (signaling, rx)
    }

    /// While offline, sends from `peer` fail as if its socket were down.
    pub fn set_offline(&self, peer: impl Into<PeerId>, offline: bool) {
        let peer = peer.into();
        let mut guard = self.offline.lock();
        if offline {
            guard.insert(peer);
        } else {
            guard.remove(&peer);
        }
    }

    fn is_offline(&self, peer: &PeerId) -> bool {
        self.offline.lock().contains(peer)
    }

    fn deliver(&self, from: &PeerId, mut message: SignalingMessage) {
        let Some(target) = message.target_id().cloned() else {
            return;
        };
        if let Some(route) = message.route_mut() {
            route.source_id = Some(from.clone());
        }
        if let Some(tx) = self.peers.lock().get(&target) {
            let _ = tx.send(message);
        }
    }
}

pub struct MemorySignaling {
    local: PeerId,
    relay: MemoryRelay,
    sent: Mutex<Vec<SignalingMessage>>,
}

impl MemorySignaling {
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl SignalTransport for MemorySignaling {
    async fn send_signal(&self, message: SignalingMessage) -> Result<(), TransportError> {
        if self.relay.is_offline(&self.local) {
            return Err(TransportError::SignalingClosed);
        }
        self.sent.lock().push(message.clone());
        self.relay.deliver(&self.local, message);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.relay.is_offline(&self.local)
    }

    async fn wait_connected(&self, _timeout: Duration) -> bool {
        self.is_connected()
    }
}
