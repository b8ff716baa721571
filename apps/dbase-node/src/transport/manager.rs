use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex as AsyncMutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::payload::{InboundAssembler, Payload};
use super::session::{Effect, SessionEvent, SessionState, Transition, transition};
use super::{
    ChunkConfig, Generation, IceState, LinkEvent, LinkEventSink, PeerConnector, PeerLink,
    SignalTransport, TaggedLinkEvent, TransportError,
};
use crate::protocol::{IceCandidate, PeerId, SessionDescription, SignalingMessage};
use crate::storage::RecordSink;

/// Early candidates kept per peer before any session exists.
pub const ORPHAN_CANDIDATE_LIMIT: usize = 64;
const INBOUND_BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Text { from: PeerId, content: String },
    Record { from: PeerId, key: String },
}

struct PeerSession {
    generation: Generation,
    state: SessionState,
    link: Option<Arc<dyn PeerLink>>,
    remote_description_set: bool,
    pending_candidates: VecDeque<IceCandidate>,
    cancel: CancellationToken,
    inbound: InboundAssembler,
    send_lock: Arc<AsyncMutex<()>>,
    last_error: Option<String>,
}

impl PeerSession {
    fn new(generation: Generation, pending: VecDeque<IceCandidate>, chunk: ChunkConfig) -> Self {
        Self {
            generation,
            state: SessionState::New,
            link: None,
            remote_description_set: false,
            pending_candidates: pending,
            cancel: CancellationToken::new(),
            inbound: InboundAssembler::new(chunk),
            send_lock: Arc::new(AsyncMutex::new(())),
            last_error: None,
        }
    }

    fn link(&self) -> Result<Arc<dyn PeerLink>, TransportError> {
        self.link
            .clone()
            .ok_or_else(|| TransportError::Negotiation("no connection for session".into()))
    }

    fn is_open(&self) -> bool {
        self.state.is_connected() && self.link.as_ref().is_some_and(|link| link.is_open())
    }

    async fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(link) = self.link.take() {
            link.close().await;
        }
    }
}

#[derive(Default)]
struct SessionRegistry {
    sessions: HashMap<PeerId, PeerSession>,
    orphan_candidates: HashMap<PeerId, VecDeque<IceCandidate>>,
}

struct Shared {
    local_id: PeerId,
    connector: Arc<dyn PeerConnector>,
    signals: Arc<dyn SignalTransport>,
    sink: Arc<dyn RecordSink>,
    chunk: ChunkConfig,
    registry: AsyncMutex<SessionRegistry>,
    events_tx: mpsc::UnboundedSender<TaggedLinkEvent>,
    next_generation: AtomicU64,
    ready_tx: watch::Sender<bool>,
    inbound_tx: broadcast::Sender<InboundMessage>,
}

/// Owns one session per remote peer and drives its negotiation.
///
/// Signaling input arrives through `handle_signal`; link events from every
/// session flow through one queue into a single dispatch task, which is the
/// only writer of reassembly state.
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
    dispatch: JoinHandle<()>,
}

impl PeerConnectionManager {
    pub fn new(
        local_id: PeerId,
        connector: Arc<dyn PeerConnector>,
        signals: Arc<dyn SignalTransport>,
        sink: Arc<dyn RecordSink>,
        chunk: ChunkConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);
        let (inbound_tx, _) = broadcast::channel(INBOUND_BROADCAST_CAPACITY);
        let shared = Arc::new(Shared {
            local_id,
            connector,
            signals,
            sink,
            chunk,
            registry: AsyncMutex::new(SessionRegistry::default()),
            events_tx,
            next_generation: AtomicU64::new(0),
            ready_tx,
            inbound_tx,
        });
        let dispatch = tokio::spawn(dispatch_link_events(Arc::clone(&shared), events_rx));
        Self { shared, dispatch }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    /// Starts a session towards `peer` unless one is connected or still
    /// negotiating, whichever side started it.
    pub async fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.dial(peer, false).await
    }

    /// Replaces any session that is not open with a fresh offer.
    pub async fn redial(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.dial(peer, true).await
    }

    async fn dial(&self, peer: &PeerId, force: bool) -> Result<(), TransportError> {
        if peer == &self.shared.local_id {
            return Err(TransportError::Setup("refusing to connect to self".into()));
        }
        let mut registry = self.shared.registry.lock().await;
        if let Some(session) = registry.sessions.get(peer) {
            if session.is_open() || (!force && !session.state.is_terminal()) {
                debug!(
                    target: "dbase::peer",
                    peer = %peer,
                    state = %session.state,
                    "keeping existing session"
                );
                return Ok(());
            }
        }
        self.shared.replace_session(&mut registry, peer, false).await;
        self.shared.drive(&mut registry, peer, SessionEvent::Dial).await;
        match registry.sessions.get(peer) {
            Some(session) if session.state == SessionState::Failed => Err(
                TransportError::Negotiation(session.last_error.clone().unwrap_or_default()),
            ),
            _ => Ok(()),
        }
    }

    pub async fn handle_signal(&self, message: SignalingMessage) {
        if matches!(message, SignalingMessage::Ping | SignalingMessage::Pong) {
            return;
        }
        let Some(from) = message.source_id().cloned() else {
            warn!(
                target: "dbase::peer",
                kind = message.kind(),
                "signaling message without source_id"
            );
            return;
        };
        if from == self.shared.local_id {
            warn!(target: "dbase::peer", "ignoring signaling message from self");
            return;
        }
        match message {
            SignalingMessage::Offer { description, .. } => {
                self.shared.on_remote_offer(&from, description).await
            }
            SignalingMessage::Answer { description, .. } => {
                let mut registry = self.shared.registry.lock().await;
                if !registry.sessions.contains_key(&from) {
                    warn!(target: "dbase::peer", peer = %from, "answer for unknown session");
                    return;
                }
                self.shared
                    .drive(&mut registry, &from, SessionEvent::RemoteAnswer(description))
                    .await;
            }
            SignalingMessage::Candidate { candidate, .. } => {
                self.shared.on_remote_candidate(&from, candidate).await
            }
            SignalingMessage::Ping | SignalingMessage::Pong => {}
        }
    }

    /// Sends a payload over the peer's open channel. Returns the frame count.
    ///
    /// A channel that dies part way through fails the session, so the next
    /// `connect` starts over instead of waiting on it.
    pub async fn send(&self, peer: &PeerId, payload: &Payload) -> Result<usize, TransportError> {
        let (generation, link, send_lock) = {
            let registry = self.shared.registry.lock().await;
            match registry.sessions.get(peer) {
                Some(session) if session.is_open() => (
                    session.generation,
                    session.link()?,
                    Arc::clone(&session.send_lock),
                ),
                _ => return Err(TransportError::ChannelNotOpen(peer.clone())),
            }
        };
        let frames = payload.encode_frames(&self.shared.chunk)?;
        let _guard = send_lock.lock().await;
        for (seq, frame) in frames.iter().enumerate() {
            if let Err(err) = link.send(frame.clone()).await {
                if err.is_channel_failure() {
                    warn!(
                        target: "dbase::chunk",
                        peer = %peer,
                        key = %payload.key(),
                        seq,
                        error = %err,
                        "channel lost mid-payload"
                    );
                    self.shared.fail_session(peer, generation).await;
                }
                return Err(err);
            }
        }
        debug!(
            target: "dbase::chunk",
            peer = %peer,
            key = %payload.key(),
            frames = frames.len(),
            "payload sent"
        );
        Ok(frames.len())
    }

    pub async fn is_ready(&self, peer: &PeerId) -> bool {
        let registry = self.shared.registry.lock().await;
        registry.sessions.get(peer).is_some_and(PeerSession::is_open)
    }

    pub async fn state(&self, peer: &PeerId) -> Option<SessionState> {
        let registry = self.shared.registry.lock().await;
        registry.sessions.get(peer).map(|session| session.state)
    }

    pub async fn generation(&self, peer: &PeerId) -> Option<Generation> {
        let registry = self.shared.registry.lock().await;
        registry.sessions.get(peer).map(|session| session.generation)
    }

    /// Whether a partial record from `peer` is buffered under `key`.
    pub async fn reassembling(&self, peer: &PeerId, key: &str) -> bool {
        let registry = self.shared.registry.lock().await;
        registry
            .sessions
            .get(peer)
            .is_some_and(|session| session.inbound.in_flight(key))
    }

    /// True while at least one session is connected.
    pub fn ready_watch(&self) -> watch::Receiver<bool> {
        self.shared.ready_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InboundMessage> {
        self.shared.inbound_tx.subscribe()
    }

    pub async fn close(&self, peer: &PeerId) {
        let mut registry = self.shared.registry.lock().await;
        self.shared
            .drive(&mut registry, peer, SessionEvent::Close)
            .await;
        registry.sessions.remove(peer);
        self.shared.publish_readiness(&registry);
    }

    pub async fn shutdown(&self) {
        let mut registry = self.shared.registry.lock().await;
        let peers: Vec<PeerId> = registry.sessions.keys().cloned().collect();
        for peer in &peers {
            self.shared
                .drive(&mut registry, peer, SessionEvent::Close)
                .await;
        }
        registry.sessions.clear();
        registry.orphan_candidates.clear();
        self.shared.publish_readiness(&registry);
        info!(target: "dbase::peer", sessions = peers.len(), "peer manager shut down");
    }
}

impl Drop for PeerConnectionManager {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

impl Shared {
    async fn fail_session(&self, peer: &PeerId, generation: Generation) {
        let mut registry = self.registry.lock().await;
        if registry
            .sessions
            .get(peer)
            .is_some_and(|session| session.generation == generation)
        {
            self.drive(&mut registry, peer, SessionEvent::ChannelClosed)
                .await;
        }
    }

    async fn replace_session(
        &self,
        registry: &mut SessionRegistry,
        peer: &PeerId,
        carry_pending: bool,
    ) -> Generation {
        let mut pending = registry.orphan_candidates.remove(peer).unwrap_or_default();
        if let Some(mut old) = registry.sessions.remove(peer) {
            info!(
                target: "dbase::peer",
                peer = %peer,
                generation = old.generation,
                state = %old.state,
                "replacing session"
            );
            if carry_pending && !old.remote_description_set {
                let mut carried = std::mem::take(&mut old.pending_candidates);
                carried.extend(pending);
                pending = carried;
            }
            old.state = SessionState::Closed;
            old.teardown().await;
        }
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        registry
            .sessions
            .insert(peer.clone(), PeerSession::new(generation, pending, self.chunk));
        self.publish_readiness(registry);
        generation
    }

    async fn on_remote_offer(&self, from: &PeerId, description: SessionDescription) {
        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.sessions.get(from) {
            if session.state == SessionState::OfferSent && self.local_id < *from {
                info!(
                    target: "dbase::peer",
                    peer = %from,
                    "offer glare; keeping local offer"
                );
                return;
            }
        }
        self.replace_session(&mut registry, from, true).await;
        self.drive(&mut registry, from, SessionEvent::RemoteOffer(description))
            .await;
    }

    async fn on_remote_candidate(&self, from: &PeerId, candidate: IceCandidate) {
        let mut registry = self.registry.lock().await;
        if let Some(session) = registry.sessions.get_mut(from) {
            if !session.state.is_terminal() {
                match (&session.link, session.remote_description_set) {
                    (Some(link), true) => {
                        if let Err(err) = link.add_ice_candidate(candidate).await {
                            warn!(
                                target: "dbase::peer",
                                peer = %from,
                                error = %err,
                                "failed to add remote ice candidate"
                            );
                        }
                    }
                    _ => {
                        session.pending_candidates.push_back(candidate);
                        trace!(
                            target: "dbase::peer",
                            peer = %from,
                            queued = session.pending_candidates.len(),
                            "buffered early ice candidate"
                        );
                    }
                }
                return;
            }
        }
        let queue = registry.orphan_candidates.entry(from.clone()).or_default();
        if queue.len() >= ORPHAN_CANDIDATE_LIMIT {
            queue.pop_front();
            warn!(target: "dbase::peer", peer = %from, "orphan candidate queue full; dropping oldest");
        }
        queue.push_back(candidate);
    }

    /// Feeds an event through the state machine and executes the resulting
    /// effects. Effects may produce follow-up events; a failed effect turns
    /// into `NegotiationFailed`.
    async fn drive(&self, registry: &mut SessionRegistry, peer: &PeerId, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            let Some(session) = registry.sessions.get_mut(peer) else {
                return;
            };
            let from = session.state;
            let generation = session.generation;
            let name = event.name();
            if let SessionEvent::NegotiationFailed(reason) = &event {
                session.last_error = Some(reason.clone());
            }
            let Transition { next, effects } = match transition(from, event) {
                Ok(transition) => transition,
                Err(ignored) => {
                    debug!(
                        target: "dbase::peer",
                        peer = %peer,
                        generation,
                        state = %ignored.state,
                        event = ignored.event,
                        "ignoring session event"
                    );
                    continue;
                }
            };
            session.state = next;
            debug!(
                target: "dbase::peer",
                peer = %peer,
                generation,
                from = %from,
                to = %next,
                event = name,
                "session transition"
            );

            for effect in effects {
                match self.run_effect(registry, peer, effect).await {
                    Ok(Some(follow_up)) => queue.push_back(follow_up),
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target: "dbase::peer",
                            peer = %peer,
                            generation,
                            error = %err,
                            "negotiation step failed"
                        );
                        queue.push_back(SessionEvent::NegotiationFailed(err.to_string()));
                        break;
                    }
                }
            }
        }
    }

    async fn run_effect(
        &self,
        registry: &mut SessionRegistry,
        peer: &PeerId,
        effect: Effect,
    ) -> Result<Option<SessionEvent>, TransportError> {
        let Some(session) = registry.sessions.get_mut(peer) else {
            return Ok(None);
        };
        match effect {
            Effect::CreateConnection => {
                let events =
                    LinkEventSink::new(peer.clone(), session.generation, self.events_tx.clone());
                session.link = Some(self.connector.connect(peer, events).await?);
            }
            Effect::CreateDataChannel => session.link()?.create_data_channel().await?,
            Effect::SendOffer => {
                let offer = session.link()?.create_offer().await?;
                self.signals
                    .send_signal(SignalingMessage::offer_to(peer.clone(), offer))
                    .await?;
            }
            Effect::ApplyRemoteDescription(description) => {
                session.link()?.set_remote_description(description).await?;
                session.remote_description_set = true;
            }
            Effect::DrainCandidates => {
                let link = session.link()?;
                let pending: Vec<IceCandidate> = session.pending_candidates.drain(..).collect();
                let count = pending.len();
                for candidate in pending {
                    if let Err(err) = link.add_ice_candidate(candidate).await {
                        warn!(
                            target: "dbase::peer",
                            peer = %peer,
                            error = %err,
                            "failed to add buffered ice candidate"
                        );
                    }
                }
                if count > 0 {
                    debug!(target: "dbase::peer", peer = %peer, count, "drained buffered candidates");
                }
            }
            Effect::SendAnswer => {
                let answer = session.link()?.create_answer().await?;
                self.signals
                    .send_signal(SignalingMessage::answer_to(peer.clone(), answer))
                    .await?;
                return Ok(Some(SessionEvent::AnswerSent));
            }
            Effect::ReportReady => {
                info!(target: "dbase::peer", peer = %peer, "peer ready");
                self.publish_readiness(registry);
            }
            Effect::ReportNotReady => {
                info!(target: "dbase::peer", peer = %peer, "peer not ready");
                self.publish_readiness(registry);
            }
            Effect::Teardown => session.teardown().await,
        }
        Ok(None)
    }

    fn publish_readiness(&self, registry: &SessionRegistry) {
        let any = registry
            .sessions
            .values()
            .any(|session| session.state.is_connected());
        self.ready_tx.send_if_modified(|current| {
            let changed = *current != any;
            *current = any;
            changed
        });
    }

    async fn on_link_event(&self, tagged: TaggedLinkEvent) {
        let TaggedLinkEvent {
            peer,
            generation,
            event,
        } = tagged;
        let mut registry = self.registry.lock().await;
        let Some(session) = registry.sessions.get_mut(&peer) else {
            trace!(target: "dbase::peer", peer = %peer, "link event for unknown session");
            return;
        };
        if session.generation != generation || session.cancel.is_cancelled() {
            trace!(
                target: "dbase::peer",
                peer = %peer,
                generation,
                current = session.generation,
                "discarding stale link event"
            );
            return;
        }

        match event {
            LinkEvent::LocalCandidate(candidate) => {
                drop(registry);
                let message = SignalingMessage::candidate_to(peer.clone(), candidate);
                if let Err(err) = self.signals.send_signal(message).await {
                    warn!(
                        target: "dbase::peer",
                        peer = %peer,
                        error = %err,
                        "local ice candidate lost"
                    );
                }
            }
            LinkEvent::ChannelOpen => {
                self.drive(&mut registry, &peer, SessionEvent::ChannelOpen)
                    .await
            }
            LinkEvent::ChannelClosed => {
                self.drive(&mut registry, &peer, SessionEvent::ChannelClosed)
                    .await
            }
            LinkEvent::IceState(IceState::Failed) => {
                self.drive(&mut registry, &peer, SessionEvent::IceFailed)
                    .await
            }
            LinkEvent::IceState(IceState::Disconnected) => {
                self.drive(&mut registry, &peer, SessionEvent::IceDisconnected)
                    .await
            }
            LinkEvent::IceState(state) => {
                debug!(target: "dbase::peer", peer = %peer, ?state, "ice state");
            }
            LinkEvent::Message(bytes) => {
                let result = session.inbound.ingest(&bytes, Instant::now());
                drop(registry);
                match result {
                    Ok(Some(payload)) => self.deliver(&peer, payload).await,
                    Ok(None) => {}
                    Err(err) => {
                        warn!(
                            target: "dbase::chunk",
                            peer = %peer,
                            error = %err,
                            "dropping inbound data"
                        );
                    }
                }
            }
        }
    }

    async fn deliver(&self, from: &PeerId, payload: Payload) {
        match payload {
            Payload::Record(record) => {
                let key = record.key.clone();
                match self.sink.store(from, record).await {
                    Ok(()) => {
                        info!(target: "dbase::transfer", from = %from, key = %key, "record received");
                        let _ = self.inbound_tx.send(InboundMessage::Record {
                            from: from.clone(),
                            key,
                        });
                    }
                    Err(err) => {
                        error!(
                            target: "dbase::storage",
                            from = %from,
                            key = %key,
                            error = %err,
                            "failed to store record"
                        );
                    }
                }
            }
            Payload::Text(text) => {
                info!(target: "dbase::transfer", from = %from, "text received");
                let _ = self.inbound_tx.send(InboundMessage::Text {
                    from: from.clone(),
                    content: text.content,
                });
            }
        }
    }
}

async fn dispatch_link_events(
    shared: Arc<Shared>,
    mut events: mpsc::UnboundedReceiver<TaggedLinkEvent>,
) {
    while let Some(event) = events.recv().await {
        shared.on_link_event(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KvRecord;
    use crate::storage::MemorySink;
    use crate::transport::mock::{MemoryRelay, MemorySignaling, MockConnector, MockNetwork};
    use serde_json::json;
    use std::time::Duration;

    struct Node {
        manager: Arc<PeerConnectionManager>,
        connector: Arc<MockConnector>,
        signaling: Arc<MemorySignaling>,
        sink: Arc<MemorySink>,
        _pump: JoinHandle<()>,
    }

    fn node(network: &MockNetwork, relay: &MemoryRelay, id: &str) -> Node {
        let connector = network.connector(id);
        let (signaling, mut inbound) = relay.join(id);
        let sink = Arc::new(MemorySink::new());
        let manager = Arc::new(PeerConnectionManager::new(
            PeerId::from(id),
            connector.clone(),
            signaling.clone(),
            sink.clone(),
            ChunkConfig::default(),
        ));
        let pump_manager = Arc::clone(&manager);
        let pump = tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                pump_manager.handle_signal(message).await;
            }
        });
        Node {
            manager,
            connector,
            signaling,
            sink,
            _pump: pump,
        }
    }

    async fn wait_ready(manager: &PeerConnectionManager, peer: &PeerId) -> bool {
        for _ in 0..200 {
            if manager.is_ready(peer).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn dial_connects_both_sides() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&a.manager, &pb).await);
        assert!(wait_ready(&b.manager, &pa).await);
        assert!(*a.manager.ready_watch().borrow());
        assert_eq!(b.manager.state(&pa).await, Some(SessionState::Connected));

        let kinds: Vec<&str> = a.signaling.sent().iter().map(|m| m.kind()).collect();
        assert_eq!(kinds.first(), Some(&"offer"));
        assert!(kinds.contains(&"candidate"));
    }

    #[tokio::test]
    async fn early_candidates_apply_in_arrival_order() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        let early: Vec<IceCandidate> = (1..=3)
            .map(|n| IceCandidate::new(format!("candidate:{n} 1 udp 1 10.0.0.{n} 5000 typ host")))
            .collect();
        for candidate in &early {
            let mut message = SignalingMessage::candidate_to(pb.clone(), candidate.clone());
            if let Some(route) = message.route_mut() {
                route.source_id = Some(pa.clone());
            }
            b.manager.handle_signal(message).await;
        }

        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&b.manager, &pa).await);

        let links = b.connector.links_to(&pa);
        assert_eq!(links.len(), 1);
        let applied = links[0].applied_candidates();
        assert!(applied.len() >= 3);
        assert_eq!(&applied[..3], early.as_slice());
    }

    #[tokio::test]
    async fn glare_resolves_to_single_connection() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        let (ra, rb) = tokio::join!(a.manager.connect(&pb), b.manager.connect(&pa));
        ra.unwrap();
        rb.unwrap();
        assert!(wait_ready(&a.manager, &pb).await);
        assert!(wait_ready(&b.manager, &pa).await);
    }

    #[tokio::test]
    async fn stale_generation_cannot_deliver() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&b.manager, &pa).await);
        let stale = b.connector.links_to(&pa).remove(0);

        a.manager.close(&pb).await;
        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&a.manager, &pb).await);
        assert!(wait_ready(&b.manager, &pa).await);
        assert!(b.manager.generation(&pa).await.unwrap() > stale.generation());
        assert!(stale.is_closed());

        let frames = Payload::Record(KvRecord::new("ghost", json!(1)))
            .encode_frames(&ChunkConfig::default())
            .unwrap();
        for frame in frames {
            stale.inject(LinkEvent::Message(frame));
        }
        a.manager
            .send(&pb, &Payload::Record(KvRecord::new("live", json!(2))))
            .await
            .unwrap();
        assert!(b.sink.wait_for(1, Duration::from_secs(1)).await);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let keys: Vec<String> = b.sink.records().into_iter().map(|(_, r)| r.key).collect();
        assert_eq!(keys, vec!["live".to_string()]);
    }

    #[tokio::test]
    async fn offer_send_failure_marks_session_failed() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let pb = PeerId::from("node-b");
        relay.set_offline("node-a", true);

        let err = a.manager.connect(&pb).await.unwrap_err();
        assert!(matches!(err, TransportError::Negotiation(_)));
        assert_eq!(a.manager.state(&pb).await, Some(SessionState::Failed));
        assert!(!a.manager.is_ready(&pb).await);
    }

    #[tokio::test]
    async fn close_tears_down_and_reports_not_ready() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&a.manager, &pb).await);
        let mut ready = a.manager.ready_watch();
        a.manager.close(&pb).await;
        assert_eq!(a.manager.state(&pb).await, None);
        assert!(!*ready.borrow_and_update());
        assert!(a.connector.links_to(&pb)[0].is_closed());

        for _ in 0..100 {
            if b.manager.state(&pa).await == Some(SessionState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(b.manager.state(&pa).await, Some(SessionState::Failed));
    }

    #[tokio::test]
    async fn ice_dropout_reports_not_ready_but_keeps_the_channel() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let b = node(&network, &relay, "node-b");
        let (pa, pb) = (PeerId::from("node-a"), PeerId::from("node-b"));

        a.manager.connect(&pb).await.unwrap();
        assert!(wait_ready(&a.manager, &pb).await);
        assert!(wait_ready(&b.manager, &pa).await);
        let link = a.connector.links_to(&pb).remove(0);
        let mut ready = a.manager.ready_watch();
        assert!(*ready.borrow_and_update());

        assert!(link.inject(LinkEvent::IceState(IceState::Disconnected)));
        for _ in 0..100 {
            if a.manager.state(&pb).await == Some(SessionState::Failed) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.manager.state(&pb).await, Some(SessionState::Failed));
        assert!(!a.manager.is_ready(&pb).await);
        assert!(!*ready.borrow_and_update());

        assert!(!link.is_closed());
        assert!(link.is_open());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(b.manager.state(&pa).await, Some(SessionState::Connected));
    }

    #[tokio::test]
    async fn send_requires_open_channel() {
        let network = MockNetwork::new();
        let relay = MemoryRelay::new();
        let a = node(&network, &relay, "node-a");
        let err = a
            .manager
            .send(&PeerId::from("node-z"), &Payload::Record(KvRecord::new("k", json!(0))))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::ChannelNotOpen(_)));
        assert!(a.manager.connect(&PeerId::from("node-a")).await.is_err());
    }
}
