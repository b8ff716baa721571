//! Per-peer negotiation state machine.
//!
//! `transition` is pure: it maps a state and an event to the next state plus
//! the effects the manager must carry out, in order. Nothing here touches a
//! connection.
//!
//! A failed session keeps its connection; only `Close` or replacing the
//! session tears it down.

use std::fmt;

use crate::protocol::SessionDescription;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    New,
    OfferSent,
    Answering,
    AnswerSent,
    Negotiated,
    Connected,
    Failed,
    Closed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Failed | SessionState::Closed)
    }

    pub fn is_connected(self) -> bool {
        self == SessionState::Connected
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::New => "new",
            SessionState::OfferSent => "offer_sent",
            SessionState::Answering => "answering",
            SessionState::AnswerSent => "answer_sent",
            SessionState::Negotiated => "negotiated",
            SessionState::Connected => "connected",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Dial,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    AnswerSent,
    ChannelOpen,
    IceFailed,
    IceDisconnected,
    ChannelClosed,
    NegotiationFailed(String),
    Close,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Dial => "dial",
            SessionEvent::RemoteOffer(_) => "remote_offer",
            SessionEvent::RemoteAnswer(_) => "remote_answer",
            SessionEvent::AnswerSent => "answer_sent",
            SessionEvent::ChannelOpen => "channel_open",
            SessionEvent::IceFailed => "ice_failed",
            SessionEvent::IceDisconnected => "ice_disconnected",
            SessionEvent::ChannelClosed => "channel_closed",
            SessionEvent::NegotiationFailed(_) => "negotiation_failed",
            SessionEvent::Close => "close",
        }
    }

    fn is_failure(&self) -> bool {
        matches!(
            self,
            SessionEvent::IceFailed
                | SessionEvent::IceDisconnected
                | SessionEvent::ChannelClosed
                | SessionEvent::NegotiationFailed(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    CreateConnection,
    CreateDataChannel,
    SendOffer,
    ApplyRemoteDescription(SessionDescription),
    DrainCandidates,
    SendAnswer,
    ReportReady,
    ReportNotReady,
    Teardown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }
}

/// The event has no meaning in the current state and changes nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ignored {
    pub state: SessionState,
    pub event: &'static str,
}

pub fn transition(state: SessionState, event: SessionEvent) -> Result<Transition, Ignored> {
    use SessionState::*;

    if event == SessionEvent::Close {
        return Ok(match state {
            Closed => Transition::to(Closed, Vec::new()),
            Connected => Transition::to(Closed, vec![Effect::ReportNotReady, Effect::Teardown]),
            _ => Transition::to(Closed, vec![Effect::Teardown]),
        });
    }
    if event.is_failure() && !state.is_terminal() {
        return Ok(Transition::to(Failed, vec![Effect::ReportNotReady]));
    }

    match (state, event) {
        (New, SessionEvent::Dial) => Ok(Transition::to(
            OfferSent,
            vec![
                Effect::CreateConnection,
                Effect::CreateDataChannel,
                Effect::SendOffer,
            ],
        )),
        (New, SessionEvent::RemoteOffer(description)) => Ok(Transition::to(
            Answering,
            vec![
                Effect::CreateConnection,
                Effect::ApplyRemoteDescription(description),
                Effect::DrainCandidates,
                Effect::SendAnswer,
            ],
        )),
        (Answering, SessionEvent::AnswerSent) => Ok(Transition::to(AnswerSent, Vec::new())),
        (OfferSent, SessionEvent::RemoteAnswer(description)) => Ok(Transition::to(
            Negotiated,
            vec![
                Effect::ApplyRemoteDescription(description),
                Effect::DrainCandidates,
            ],
        )),
        (Negotiated | AnswerSent, SessionEvent::ChannelOpen) => {
            Ok(Transition::to(Connected, vec![Effect::ReportReady]))
        }
        (state, event) => Err(Ignored {
            state,
            event: event.name(),
        }),
    }
}
