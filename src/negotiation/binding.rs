use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::{MediaTrack, TrackKind};
use crate::signaling::IceCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Connection state reported by the underlying peer transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications from a binding, delivered in order on one channel
#[derive(Debug, Clone)]
pub enum BindingEvent {
    CandidateDiscovered(IceCandidate),
    RemoteTrack(Arc<MediaTrack>),
    StateChanged(LinkState),
}

/// Platform peer transport (ICE, DTLS, RTP) behind one PeerConnection
///
/// Outbound senders exist for both kinds from creation on, so
/// `replace_track` never needs a renegotiation.
#[async_trait]
pub trait PeerTransportBinding: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Start sending `track` on the sender of its kind
    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError>;

    /// Swap the source of the `kind` sender; None sends nothing
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError>;

    async fn close(&self);
}

/// Creates one binding per PeerConnection
#[async_trait]
pub trait PeerBindingFactory: Send + Sync {
    async fn create(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerTransportBinding>,
            mpsc::UnboundedReceiver<BindingEvent>,
        ),
        NegotiationError,
    >;

    /// Factory name for logging
    fn name(&self) -> &str;
}
