//! Relay wire format.
//!
//! The relay speaks plain JSON objects. Negotiation messages are recognised by
//! which of `offer`, `answer` or `candidate` is present; keep-alives use a
//! `type` field. Outbound messages carry `target_id`, and the relay stamps
//! `source_id` on delivery.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::PeerId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// Browser-compatible `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-compatible `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        default,
        rename = "sdpMLineIndex",
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Route {
    pub source_id: Option<PeerId>,
    pub target_id: Option<PeerId>,
}

impl Route {
    pub fn to(target: PeerId) -> Self {
        Self {
            source_id: None,
            target_id: Some(target),
        }
    }

    pub fn from_peer(source: PeerId) -> Self {
        Self {
            source_id: Some(source),
            target_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingMessage {
    Offer {
        route: Route,
        description: SessionDescription,
    },
    Answer {
        route: Route,
        description: SessionDescription,
    },
    Candidate {
        route: Route,
        candidate: IceCandidate,
    },
    Ping,
    Pong,
}

#[derive(Debug, Error)]
pub enum SignalDecodeError {
    #[error("invalid signaling json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown signaling message type `{0}`")]
    UnknownType(String),
    #[error("signaling message carries no payload")]
    Empty,
    #[error("signaling message carries {0} payloads, expected exactly one")]
    Ambiguous(usize),
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct WireSignal {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    answer: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_id: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    target_id: Option<PeerId>,
}

impl SignalingMessage {
    pub fn offer_to(target: PeerId, description: SessionDescription) -> Self {
        Self::Offer {
            route: Route::to(target),
            description,
        }
    }

    pub fn answer_to(target: PeerId, description: SessionDescription) -> Self {
        Self::Answer {
            route: Route::to(target),
            description,
        }
    }

    pub fn candidate_to(target: PeerId, candidate: IceCandidate) -> Self {
        Self::Candidate {
            route: Route::to(target),
            candidate,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::Ping => "ping",
            Self::Pong => "pong",
        }
    }

    pub fn route(&self) -> Option<&Route> {
        match self {
            Self::Offer { route, .. } | Self::Answer { route, .. } | Self::Candidate { route, .. } => {
                Some(route)
            }
            Self::Ping | Self::Pong => None,
        }
    }

    pub fn route_mut(&mut self) -> Option<&mut Route> {
        match self {
            Self::Offer { route, .. } | Self::Answer { route, .. } | Self::Candidate { route, .. } => {
                Some(route)
            }
            Self::Ping | Self::Pong => None,
        }
    }

    pub fn source_id(&self) -> Option<&PeerId> {
        self.route().and_then(|route| route.source_id.as_ref())
    }

    pub fn target_id(&self) -> Option<&PeerId> {
        self.route().and_then(|route| route.target_id.as_ref())
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        let wire = match self {
            Self::Offer { route, description } => WireSignal {
                offer: Some(description.clone()),
                source_id: route.source_id.clone(),
                target_id: route.target_id.clone(),
                ..Default::default()
            },
            Self::Answer { route, description } => WireSignal {
                answer: Some(description.clone()),
                source_id: route.source_id.clone(),
                target_id: route.target_id.clone(),
                ..Default::default()
            },
            Self::Candidate { route, candidate } => WireSignal {
                candidate: Some(candidate.clone()),
                source_id: route.source_id.clone(),
                target_id: route.target_id.clone(),
                ..Default::default()
            },
            Self::Ping => WireSignal {
                kind: Some("ping".into()),
                ..Default::default()
            },
            Self::Pong => WireSignal {
                kind: Some("pong".into()),
                ..Default::default()
            },
        };
        serde_json::to_string(&wire)
    }

    pub fn decode(text: &str) -> Result<Self, SignalDecodeError> {
        let wire: WireSignal = serde_json::from_str(text)?;
        let route = Route {
            source_id: wire.source_id,
            target_id: wire.target_id,
        };
        let populated = [
            wire.offer.is_some(),
            wire.answer.is_some(),
            wire.candidate.is_some(),
        ]
        .into_iter()
        .filter(|present| *present)
        .count();

        match (populated, wire.kind.as_deref()) {
            (0, Some("ping")) => Ok(Self::Ping),
            (0, Some("pong")) => Ok(Self::Pong),
            (0, Some(other)) => Err(SignalDecodeError::UnknownType(other.to_string())),
            (0, None) => Err(SignalDecodeError::Empty),
            (1, _) => {
                if let Some(description) = wire.offer {
                    Ok(Self::Offer { route, description })
                } else if let Some(description) = wire.answer {
                    Ok(Self::Answer { route, description })
                } else if let Some(candidate) = wire.candidate {
                    Ok(Self::Candidate { route, candidate })
                } else {
                    Err(SignalDecodeError::Empty)
                }
            }
            (count, _) => Err(SignalDecodeError::Ambiguous(count)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn offer_encodes_in_relay_shape() {
        let msg = SignalingMessage::offer_to(
            PeerId::from("node-b"),
            SessionDescription::offer("v=0\r\n"),
        );
        let value: Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"offer": {"type": "offer", "sdp": "v=0\r\n"}, "target_id": "node-b"})
        );
    }

    #[test]
    fn decodes_candidate_from_browser_peer() {
        let text = r#"{"candidate":{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0},"source_id":"node-a"}"#;
        let msg = SignalingMessage::decode(text).expect("decode");
        match msg {
            SignalingMessage::Candidate { route, candidate } => {
                assert_eq!(route.source_id, Some(PeerId::from("node-a")));
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
                assert_eq!(candidate.sdp_mline_index, Some(0));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn keepalives_round_trip() {
        assert_eq!(
            SignalingMessage::decode(r#"{"type":"pong"}"#).unwrap(),
            SignalingMessage::Pong
        );
        assert_eq!(SignalingMessage::Ping.encode().unwrap(), r#"{"type":"ping"}"#);
    }

    #[test]
    fn rejects_unknown_and_ambiguous_shapes() {
        assert!(matches!(
            SignalingMessage::decode(r#"{"type":"hello"}"#),
            Err(SignalDecodeError::UnknownType(kind)) if kind == "hello"
        ));
        assert!(matches!(
            SignalingMessage::decode(r#"{"source_id":"x"}"#),
            Err(SignalDecodeError::Empty)
        ));
        let both = r#"{"offer":{"type":"offer","sdp":"a"},"answer":{"type":"answer","sdp":"b"}}"#;
        assert!(matches!(
            SignalingMessage::decode(both),
            Err(SignalDecodeError::Ambiguous(2))
        ));
    }
}
