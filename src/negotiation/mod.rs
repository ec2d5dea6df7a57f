pub mod binding;
pub mod negotiator;
pub mod peer;
pub mod state;
pub mod webrtc_binding;

use std::sync::Arc;

pub use binding::{
    BindingEvent, LinkState, PeerBindingFactory, PeerTransportBinding, SdpType,
    SessionDescription,
};
pub use negotiator::Negotiator;
pub use peer::PeerConnection;
pub use state::NegotiationState;
pub use webrtc_binding::WebRtcBindingFactory;

use crate::events::Event;
use crate::media::{MediaStream, MediaTrack};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone)]
pub enum NegotiationEvent {
    StateChanged {
        peer_id: String,
        state: NegotiationState,
    },
    /// Discovered locally, to be sent to the remote peer
    LocalCandidate {
        peer_id: String,
        candidate: IceCandidate,
    },
    RemoteTrack {
        peer_id: String,
        track: Arc<MediaTrack>,
        stream: Arc<MediaStream>,
    },
    /// The connection reached Failed or Closed on its own; it will not recover
    Terminated {
        peer_id: String,
        state: NegotiationState,
        reason: String,
    },
}

impl NegotiationEvent {
    pub fn peer_id(&self) -> &str {
        match self {
            NegotiationEvent::StateChanged { peer_id, .. }
            | NegotiationEvent::LocalCandidate { peer_id, .. }
            | NegotiationEvent::RemoteTrack { peer_id, .. }
            | NegotiationEvent::Terminated { peer_id, .. } => peer_id,
        }
    }
}

impl Event for NegotiationEvent {
    fn name(&self) -> &'static str {
        match self {
            NegotiationEvent::StateChanged { .. } => "state-changed",
            NegotiationEvent::LocalCandidate { .. } => "local-candidate",
            NegotiationEvent::RemoteTrack { .. } => "remote-track",
            NegotiationEvent::Terminated { .. } => "terminated",
        }
    }
}
