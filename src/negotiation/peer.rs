use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::binding::{BindingEvent, LinkState, PeerTransportBinding, SdpType, SessionDescription};
use super::state::NegotiationState;
use super::NegotiationEvent;
use crate::error::NegotiationError;
use crate::events::EventDispatcher;
use crate::media::{MediaStream, MediaTrack, StreamOrigin, TrackKind};
use crate::signaling::{IceCandidate, Role};

#[derive(Default)]
struct Handshake {
    remote_description_set: bool,
    /// Remote candidates that arrived before the remote description
    pending: VecDeque<IceCandidate>,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
}

/// One negotiated media connection to the remote peer
///
/// Handshake operations are serialized by an async lock that is held from
/// applying the remote description through the candidate flush, so a
/// candidate can never overtake the description it depends on.
pub struct PeerConnection {
    id: String,
    role: Role,
    binding: Arc<dyn PeerTransportBinding>,
    state: RwLock<NegotiationState>,
    handshake: tokio::sync::Mutex<Handshake>,
    remote_stream: Arc<MediaStream>,
    events: Arc<EventDispatcher<NegotiationEvent>>,
    pump: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerConnection {
    pub(crate) fn new(
        role: Role,
        binding: Arc<dyn PeerTransportBinding>,
        events: Arc<EventDispatcher<NegotiationEvent>>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            binding,
            state: RwLock::new(NegotiationState::Idle),
            handshake: tokio::sync::Mutex::new(Handshake::default()),
            remote_stream: Arc::new(MediaStream::new(StreamOrigin::Remote)),
            events,
            pump: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Route binding notifications into this connection
    ///
    /// The task only holds a weak reference, dropping the connection ends it.
    pub(crate) fn start_pump(self: &Arc<Self>, mut rx: mpsc::UnboundedReceiver<BindingEvent>) {
        let weak = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(peer) = weak.upgrade() else {
                    break;
                };
                peer.on_binding_event(event);
            }
        });
        *self.pump.lock() = Some(handle);
    }

    pub(crate) async fn attach_local_tracks(
        &self,
        local_stream: &MediaStream,
    ) -> Result<(), NegotiationError> {
        self.advance(NegotiationState::Initializing);

        for track in local_stream.tracks() {
            if track.is_stopped() {
                continue;
            }
            debug!("Attaching local {} track {}", track.kind(), track.id());
            if let Err(e) = self.binding.add_track(track).await {
                self.fail(format!("attaching local track failed: {}", e));
                return Err(e);
            }
        }

        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == NegotiationState::Connected
    }

    /// Tracks received from the remote peer
    pub fn remote_stream(&self) -> Arc<MediaStream> {
        self.remote_stream.clone()
    }

    pub async fn local_description(&self) -> Option<SessionDescription> {
        self.handshake.lock().await.local_description.clone()
    }

    pub async fn remote_description(&self) -> Option<SessionDescription> {
        self.handshake.lock().await.remote_description.clone()
    }

    /// Remote candidates waiting for the remote description
    pub async fn pending_candidate_count(&self) -> usize {
        self.handshake.lock().await.pending.len()
    }

    /// Offerer half of the handshake: create the offer and apply it locally
    pub async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.require_role(Role::Offerer, "create_offer")?;
        let mut handshake = self.handshake.lock().await;
        self.require_state(&[NegotiationState::Initializing], "create_offer")?;

        let offer = self
            .binding
            .create_offer()
            .await
            .map_err(|e| self.description_failed("creating offer", e))?;
        self.binding
            .set_local_description(offer.clone())
            .await
            .map_err(|e| self.description_failed("applying local offer", e))?;

        handshake.local_description = Some(offer.clone());
        self.advance(NegotiationState::OfferSent);

        info!("Peer {}: offer created", self.id);
        Ok(offer)
    }

    /// Answerer half: apply the remote offer and produce the answer to send
    pub async fn handle_remote_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, NegotiationError> {
        self.require_role(Role::Answerer, "handle_remote_offer")?;
        if offer.kind != SdpType::Offer {
            return Err(NegotiationError::Description(
                "expected an offer description".to_string(),
            ));
        }

        let mut handshake = self.handshake.lock().await;
        self.require_state(&[NegotiationState::Initializing], "handle_remote_offer")?;

        self.binding
            .set_remote_description(offer.clone())
            .await
            .map_err(|e| self.description_failed("applying remote offer", e))?;
        handshake.remote_description_set = true;
        handshake.remote_description = Some(offer);
        self.advance(NegotiationState::OfferReceived);

        let answer = self
            .binding
            .create_answer()
            .await
            .map_err(|e| self.description_failed("creating answer", e))?;
        self.binding
            .set_local_description(answer.clone())
            .await
            .map_err(|e| self.description_failed("applying local answer", e))?;
        handshake.local_description = Some(answer.clone());
        self.advance(NegotiationState::AnswerSent);

        self.flush_candidates(&mut handshake).await;

        info!("Peer {}: answer created", self.id);
        Ok(answer)
    }

    /// Offerer half: apply the remote answer
    pub async fn handle_remote_answer(
        &self,
        answer: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.require_role(Role::Offerer, "handle_remote_answer")?;
        if answer.kind != SdpType::Answer {
            return Err(NegotiationError::Description(
                "expected an answer description".to_string(),
            ));
        }

        let mut handshake = self.handshake.lock().await;
        self.require_state(&[NegotiationState::OfferSent], "handle_remote_answer")?;

        self.binding
            .set_remote_description(answer.clone())
            .await
            .map_err(|e| self.description_failed("applying remote answer", e))?;
        handshake.remote_description_set = true;
        handshake.remote_description = Some(answer);
        self.advance(NegotiationState::AnswerReceived);

        self.flush_candidates(&mut handshake).await;

        info!("Peer {}: answer applied", self.id);
        Ok(())
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    ///
    /// A candidate the binding rejects is logged and dropped; it never fails
    /// the connection.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        let mut handshake = self.handshake.lock().await;
        if self.state().is_terminal() {
            return Err(NegotiationError::Closed);
        }

        if !handshake.remote_description_set {
            handshake.pending.push_back(candidate);
            debug!(
                "Peer {}: queued remote candidate ({} pending)",
                self.id,
                handshake.pending.len()
            );
            return Ok(());
        }

        if let Err(e) = self.binding.add_ice_candidate(candidate).await {
            warn!("Peer {}: ignoring remote candidate: {}", self.id, e);
        }
        Ok(())
    }

    /// Swap the outbound track of `kind` in place, without renegotiating
    pub async fn replace_outbound_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        if self.state().is_terminal() {
            return Err(NegotiationError::Closed);
        }

        self.binding.replace_track(kind, track).await?;
        debug!("Peer {}: replaced outbound {} track", self.id, kind);
        Ok(())
    }

    /// Close the binding and stop remote tracks. Local tracks are left alone.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        // Stop the pump first so the binding's own close is not reported
        // as a terminal failure
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }

        self.advance(NegotiationState::Closed);
        self.binding.close().await;
        self.remote_stream.stop_all();

        info!("Peer {} closed", self.id);
    }

    fn on_binding_event(&self, event: BindingEvent) {
        if self.state().is_terminal() {
            return;
        }

        match event {
            BindingEvent::CandidateDiscovered(candidate) => {
                self.events.emit(NegotiationEvent::LocalCandidate {
                    peer_id: self.id.clone(),
                    candidate,
                });
            }
            BindingEvent::RemoteTrack(track) => {
                info!(
                    "Peer {}: remote {} track {} received",
                    self.id,
                    track.kind(),
                    track.id()
                );
                if let Some(previous) = self.remote_stream.set_track(track.clone()) {
                    previous.stop();
                }
                self.events.emit(NegotiationEvent::RemoteTrack {
                    peer_id: self.id.clone(),
                    track,
                    stream: self.remote_stream.clone(),
                });
            }
            BindingEvent::StateChanged(link) => match link {
                LinkState::Connected => {
                    self.advance(NegotiationState::Connected);
                }
                LinkState::Failed => self.fail("peer transport failed".to_string()),
                LinkState::Closed => {
                    if self.advance(NegotiationState::Closed) {
                        self.events.emit(NegotiationEvent::Terminated {
                            peer_id: self.id.clone(),
                            state: NegotiationState::Closed,
                            reason: "peer transport closed".to_string(),
                        });
                    }
                }
                LinkState::Disconnected => {
                    warn!("Peer {}: transport disconnected", self.id);
                }
                LinkState::New | LinkState::Connecting => {
                    debug!("Peer {}: transport {:?}", self.id, link);
                }
            },
        }
    }

    async fn flush_candidates(&self, handshake: &mut Handshake) {
        let count = handshake.pending.len();
        while let Some(candidate) = handshake.pending.pop_front() {
            if let Err(e) = self.binding.add_ice_candidate(candidate).await {
                warn!("Peer {}: ignoring queued candidate: {}", self.id, e);
            }
        }
        if count > 0 {
            debug!("Peer {}: flushed {} queued candidates", self.id, count);
        }
    }

    /// Move forward to `next`. Returns false if that would be a step back.
    fn advance(&self, next: NegotiationState) -> bool {
        {
            let mut state = self.state.write();
            if !state.can_advance_to(next) {
                return false;
            }
            *state = next;
        }

        debug!("Peer {}: {:?}", self.id, next);
        self.events.emit(NegotiationEvent::StateChanged {
            peer_id: self.id.clone(),
            state: next,
        });
        true
    }

    fn fail(&self, reason: String) {
        if self.advance(NegotiationState::Failed) {
            error!("Peer {} failed: {}", self.id, reason);
            self.events.emit(NegotiationEvent::Terminated {
                peer_id: self.id.clone(),
                state: NegotiationState::Failed,
                reason,
            });
        }
    }

    fn description_failed(&self, step: &str, e: NegotiationError) -> NegotiationError {
        self.fail(format!("{}: {}", step, e));
        match e {
            NegotiationError::Description(_) => e,
            other => NegotiationError::Description(other.to_string()),
        }
    }

    fn require_role(&self, role: Role, operation: &'static str) -> Result<(), NegotiationError> {
        if self.role != role {
            return Err(NegotiationError::WrongRole {
                operation,
                role: self.role,
            });
        }
        Ok(())
    }

    fn require_state(
        &self,
        allowed: &[NegotiationState],
        operation: &'static str,
    ) -> Result<(), NegotiationError> {
        let state = self.state();
        if !allowed.contains(&state) {
            return Err(NegotiationError::InvalidState { operation, state });
        }
        Ok(())
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.pump.lock().take() {
            handle.abort();
        }
    }
}
