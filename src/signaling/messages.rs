use serde::{Deserialize, Serialize};

/// Negotiation role assigned by the relay on room join
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Creates the offer and waits for the answer
    Offerer,
    /// Waits for the offer and replies with an answer
    Answerer,
}

/// ICE candidate as exchanged over signaling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
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

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Session-control payloads carried inside a `SignalEnvelope`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate(IceCandidate),
    ChatMessage {
        text: String,
    },
    #[serde(rename_all = "camelCase")]
    MediaState {
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// The sender started over with a fresh connection and waits for an offer
    Ready,
}

impl SignalPayload {
    /// Event name used when the payload is dispatched to subscribers
    pub fn event_name(&self) -> &'static str {
        match self {
            SignalPayload::Offer { .. } => "offer",
            SignalPayload::Answer { .. } => "answer",
            SignalPayload::Candidate(_) => "candidate",
            SignalPayload::ChatMessage { .. } => "chat-message",
            SignalPayload::MediaState { .. } => "media-state",
            SignalPayload::Ready => "ready",
        }
    }

    /// Acknowledged payloads use request/response, the rest are fire-and-forget
    pub fn requires_ack(&self) -> bool {
        matches!(self, SignalPayload::ChatMessage { .. })
    }
}

/// Room-scoped signaling message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalEnvelope {
    pub room_id: String,
    pub interview_id: String,
    pub role: Role,
    /// Identity of the sending session
    pub sender: String,
    /// Correlation id for acknowledged payloads
    pub message_id: String,
    pub payload: SignalPayload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    pub room_id: String,
    pub interview_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub room_id: String,
    pub role: Role,
    /// Other identities currently in the room
    #[serde(default)]
    pub roster: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveNotice {
    pub room_id: String,
    pub identity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryAck {
    pub message_id: String,
    /// RFC3339 timestamp set by the relay
    pub delivered_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUpdate {
    pub room_id: String,
    pub peer: String,
    pub joined: bool,
}

/// Frames sent from a session to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum OutboundFrame {
    Join(JoinRequest),
    Leave(LeaveNotice),
    Signal(SignalEnvelope),
}

impl OutboundFrame {
    pub fn room_id(&self) -> &str {
        match self {
            OutboundFrame::Join(req) => &req.room_id,
            OutboundFrame::Leave(notice) => &notice.room_id,
            OutboundFrame::Signal(envelope) => &envelope.room_id,
        }
    }

    /// Last subject token for relays that route by subject
    pub fn subject_leaf(&self) -> &'static str {
        match self {
            OutboundFrame::Join(_) => "join",
            OutboundFrame::Leave(_) => "leave",
            OutboundFrame::Signal(_) => "signal",
        }
    }
}

/// Relay responses to acknowledged requests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RelayReply {
    Joined(JoinResponse),
    Delivered(DeliveryAck),
    Rejected { reason: String },
}

/// Frames pushed from the relay to a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum InboundFrame {
    Signal(SignalEnvelope),
    Presence(PresenceUpdate),
    #[serde(rename_all = "camelCase")]
    RoomEnded {
        room_id: String,
    },
}
