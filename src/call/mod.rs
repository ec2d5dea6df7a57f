pub mod session;

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

pub use session::{CallDeps, CallSession, SavedRecording};

use crate::error::CallError;
use crate::events::Event;
use crate::media::{MediaState, MediaStream};
use crate::negotiation::NegotiationState;
use crate::recording::RecordingState;
use crate::signaling::{ConnectionStatus, Room, Session};

/// Hooks for the UI layer
#[derive(Debug, Clone)]
pub enum CallEvent {
    ConnectionState(ConnectionStatus),
    Reconnecting {
        attempt: u32,
        delay: Duration,
    },
    PeerState(NegotiationState),
    RemoteStreamAvailable(Arc<MediaStream>),
    ChatMessage {
        sender: String,
        text: String,
    },
    RemoteMediaState {
        sender: String,
        state: MediaState,
    },
    RecordingState(RecordingState),
    /// The room is gone (ended by the relay, or signaling gave up)
    CallEnded {
        room_id: String,
        reason: String,
    },
    Error(CallError),
}

impl Event for CallEvent {
    fn name(&self) -> &'static str {
        match self {
            CallEvent::ConnectionState(_) => "connection-state",
            CallEvent::Reconnecting { .. } => "reconnecting",
            CallEvent::PeerState(_) => "peer-state",
            CallEvent::RemoteStreamAvailable(_) => "remote-stream-available",
            CallEvent::ChatMessage { .. } => "chat-message",
            CallEvent::RemoteMediaState { .. } => "remote-media-state",
            CallEvent::RecordingState(_) => "recording-state",
            CallEvent::CallEnded { .. } => "call-ended",
            CallEvent::Error(_) => "error",
        }
    }
}

/// Snapshot returned by `CallSession::status`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallStatus {
    pub connection: ConnectionStatus,
    pub session: Option<Session>,
    pub room: Option<Room>,
    pub negotiation: NegotiationState,
    pub media: MediaState,
    pub recording: RecordingState,
    pub recording_duration_ms: u64,
}
