use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use super::credentials::IceServerEntry;
use super::{
    DATA_CHANNEL_LABEL, IceState, LinkEvent, LinkEventSink, PeerConnector, PeerLink,
    TransportError, to_setup_error,
};
use crate::config::TransferConfig;
use crate::protocol::{IceCandidate, PeerId, SdpKind, SessionDescription};

const BUFFER_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Creates real `RTCPeerConnection`s.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<IceServerEntry>,
    transfer: TransferConfig,
}

impl WebRtcConnector {
    pub fn new(
        ice_servers: Vec<IceServerEntry>,
        transfer: TransferConfig,
    ) -> Result<Self, TransportError> {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(Duration::from_secs(5)),
            Some(Duration::from_secs(25)),
            Some(Duration::from_secs(2)),
        );
        Ok(Self {
            api: build_api(setting)?,
            ice_servers,
            transfer,
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        peer: &PeerId,
        events: LinkEventSink,
    ) -> Result<Arc<dyn PeerLink>, TransportError> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.iter().map(IceServerEntry::to_rtc).collect(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(config)
                .await
                .map_err(to_setup_error)?,
        );
        debug!(
            target: "dbase::peer",
            peer = %peer,
            generation = events.generation(),
            "peer connection created"
        );

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => {
                        events.emit(LinkEvent::LocalCandidate(IceCandidate {
                            candidate: json.candidate,
                            sdp_mid: json.sdp_mid,
                            sdp_mline_index: json.sdp_mline_index,
                            username_fragment: json.username_fragment,
                        }));
                    }
                    Err(err) => {
                        warn!(target: "dbase::peer", error = %err, "failed to serialize local candidate");
                    }
                }
            })
        }));

        let ice_events = events.clone();
        pc.on_ice_connection_state_change(Box::new(move |state| {
            let events = ice_events.clone();
            Box::pin(async move {
                debug!(target: "dbase::peer", peer = %events.peer(), ?state, "ice connection state");
                events.emit(LinkEvent::IceState(map_ice_state(state)));
            })
        }));

        let inbound_slot: Arc<Mutex<Option<Arc<RTCDataChannel>>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&inbound_slot);
        let channel_events = events.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let slot = Arc::clone(&slot);
            let events = channel_events.clone();
            Box::pin(async move {
                if dc.label() != DATA_CHANNEL_LABEL {
                    warn!(target: "dbase::peer", label = dc.label(), "ignoring unexpected data channel");
                    return;
                }
                attach_channel(&dc, events);
                *slot.lock() = Some(dc);
            })
        }));

        Ok(Arc::new(WebRtcLink {
            peer: peer.clone(),
            pc,
            outbound: Mutex::new(None),
            inbound: inbound_slot,
            events,
            transfer: self.transfer,
        }))
    }
}

fn map_ice_state(state: RTCIceConnectionState) -> IceState {
    match state {
        RTCIceConnectionState::Checking => IceState::Checking,
        RTCIceConnectionState::Connected | RTCIceConnectionState::Completed => IceState::Connected,
        RTCIceConnectionState::Disconnected => IceState::Disconnected,
        RTCIceConnectionState::Failed => IceState::Failed,
        RTCIceConnectionState::Closed => IceState::Closed,
        _ => IceState::Other,
    }
}

fn attach_channel(dc: &Arc<RTCDataChannel>, events: LinkEventSink) {
    let open_events = events.clone();
    dc.on_open(Box::new(move || {
        let events = open_events.clone();
        Box::pin(async move {
            debug!(target: "dbase::peer", peer = %events.peer(), "data channel open");
            events.emit(LinkEvent::ChannelOpen);
        })
    }));
    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        let events = close_events.clone();
        Box::pin(async move {
            debug!(target: "dbase::peer", peer = %events.peer(), "data channel closed");
            events.emit(LinkEvent::ChannelClosed);
        })
    }));
    dc.on_error(Box::new(move |err| {
        Box::pin(async move {
            warn!(target: "dbase::peer", error = %err, "data channel error");
        })
    }));
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let events = events.clone();
        Box::pin(async move {
            trace!(target: "dbase::chunk", len = msg.data.len(), "frame received");
            events.emit(LinkEvent::Message(msg.data));
        })
    }));
}

fn detach_channel(dc: &Arc<RTCDataChannel>) {
    dc.on_open(Box::new(|| Box::pin(async {})));
    dc.on_close(Box::new(|| Box::pin(async {})));
    dc.on_error(Box::new(|_| Box::pin(async {})));
    dc.on_message(Box::new(|_| Box::pin(async {})));
}

pub struct WebRtcLink {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    outbound: Mutex<Option<Arc<RTCDataChannel>>>,
    inbound: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    events: LinkEventSink,
    transfer: TransferConfig,
}

impl WebRtcLink {
    /// The outbound channel when we dialed, otherwise the one the remote opened.
    fn channel(&self) -> Option<Arc<RTCDataChannel>> {
        let open = |dc: &Arc<RTCDataChannel>| dc.ready_state() == RTCDataChannelState::Open;
        let outbound = self.outbound.lock().clone();
        let inbound = self.inbound.lock().clone();
        outbound
            .filter(open)
            .or_else(|| inbound.filter(open))
    }

    async fn wait_for_buffer_space(&self, dc: &RTCDataChannel) -> Result<(), TransportError> {
        let deadline = Instant::now() + self.transfer.backpressure_timeout;
        loop {
            let buffered = dc.buffered_amount().await;
            if buffered < self.transfer.high_watermark {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    target: "dbase::chunk",
                    peer = %self.peer,
                    buffered,
                    "data channel buffer did not drain"
                );
                return Err(TransportError::Timeout);
            }
            if dc.ready_state() != RTCDataChannelState::Open {
                return Err(TransportError::ChannelClosed);
            }
            sleep(BUFFER_POLL_INTERVAL).await;
        }
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match description.kind {
        SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
        SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        SdpKind::Pranswer => RTCSessionDescription::pranswer(description.sdp),
        SdpKind::Rollback => {
            return Err(TransportError::Negotiation(
                "rollback descriptions are not supported".into(),
            ));
        }
    };
    parsed.map_err(to_setup_error)
}

#[async_trait]
impl PeerLink for WebRtcLink {
    async fn create_data_channel(&self) -> Result<(), TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
            .await
            .map_err(to_setup_error)?;
        attach_channel(&dc, self.events.clone());
        *self.outbound.lock() = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, TransportError> {
        let answer = self.pc.create_answer(None).await.map_err(to_setup_error)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(to_setup_error)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError> {
        let description = to_rtc_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(to_setup_error)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(to_setup_error)
    }

    async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
        let dc = self
            .channel()
            .ok_or_else(|| TransportError::ChannelNotOpen(self.peer.clone()))?;
        self.wait_for_buffer_space(&dc).await?;
        dc.send(&frame).await.map_err(|err| {
            warn!(target: "dbase::chunk", peer = %self.peer, error = %err, "data channel send failed");
            TransportError::ChannelClosed
        })?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.channel().is_some()
    }

    async fn close(&self) {
        self.pc.on_ice_candidate(Box::new(|_| Box::pin(async {})));
        self.pc
            .on_ice_connection_state_change(Box::new(|_| Box::pin(async {})));
        self.pc.on_data_channel(Box::new(|_| Box::pin(async {})));
        let channels = [self.outbound.lock().take(), self.inbound.lock().take()];
        for dc in channels.into_iter().flatten() {
            detach_channel(&dc);
            if let Err(err) = dc.close().await {
                debug!(target: "dbase::peer", error = %err, "data channel close failed");
            }
        }
        if let Err(err) = self.pc.close().await {
            debug!(target: "dbase::peer", peer = %self.peer, error = %err, "peer connection close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn ice_states_map_to_link_states() {
        assert_eq!(map_ice_state(RTCIceConnectionState::Failed), IceState::Failed);
        assert_eq!(map_ice_state(RTCIceConnectionState::Completed), IceState::Connected);
        assert_eq!(
            map_ice_state(RTCIceConnectionState::Disconnected),
            IceState::Disconnected
        );
        assert_eq!(map_ice_state(RTCIceConnectionState::New), IceState::Other);
    }

    #[test]
    fn rollback_is_rejected() {
        let description = SessionDescription {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        };
        assert!(to_rtc_description(description).is_err());
    }

    #[tokio::test]
    async fn offer_gathers_local_description() {
        let connector = WebRtcConnector::new(Vec::new(), TransferConfig::default()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = PeerId::from("remote");
        let link = connector
            .connect(&peer, LinkEventSink::new(peer.clone(), 1, tx))
            .await
            .unwrap();
        link.create_data_channel().await.unwrap();
        let offer = link.create_offer().await.unwrap();
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("webrtc-datachannel"));
        assert!(!link.is_open());
        link.close().await;
    }
}
