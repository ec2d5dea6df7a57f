use serde::Serialize;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{CallEvent, CallStatus};
use crate::config::Config;
use crate::error::{CallError, TransportError};
use crate::events::{EventDispatcher, Subscription};
use crate::media::{DeviceEvent, DeviceManager, MediaSource, MediaState, TrackKind};
use crate::negotiation::{
    NegotiationEvent, NegotiationState, Negotiator, PeerBindingFactory, PeerConnection,
    SessionDescription,
};
use crate::recording::{
    Artifact, ArtifactSink, EncoderFactory, RecordingEvent, RecordingInfo, RecordingPipeline,
    RecordingState,
};
use crate::signaling::{
    ConnectionStatus, IceCandidate, PresenceUpdate, RelayConnector, Role, Room, SendOutcome,
    SignalEnvelope, SignalPayload, SignalingTransport, TransportEvent,
};

/// Automatic restarts allowed after a peer connection ends, until one connects
const MAX_PEER_RESTARTS: u32 = 3;

/// Platform collaborators of a call
pub struct CallDeps {
    pub connector: Arc<dyn RelayConnector>,
    pub bindings: Arc<dyn PeerBindingFactory>,
    pub media: Arc<dyn MediaSource>,
    pub encoder: Arc<dyn EncoderFactory>,
    pub sink: Arc<dyn ArtifactSink>,
}

/// A stopped recording and where the sink put it
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SavedRecording {
    #[serde(flatten)]
    pub artifact: Artifact,
    pub location: Option<String>,
}

/// Work for the driver task, processed strictly in arrival order
#[derive(Debug)]
enum CallTask {
    Signal(SignalEnvelope),
    Presence(PresenceUpdate),
    Reconnected,
    RoomGone { room_id: String, reason: String },
    LocalCandidate { peer_id: String, candidate: IceCandidate },
    PeerConnected { peer_id: String },
    PeerTerminated { peer_id: String },
    MediaState(MediaState),
}

impl CallTask {
    fn kind(&self) -> &'static str {
        match self {
            CallTask::Signal(envelope) => envelope.payload.event_name(),
            CallTask::Presence(_) => "presence",
            CallTask::Reconnected => "reconnected",
            CallTask::RoomGone { .. } => "room-gone",
            CallTask::LocalCandidate { .. } => "local-candidate",
            CallTask::PeerConnected { .. } => "peer-connected",
            CallTask::PeerTerminated { .. } => "peer-terminated",
            CallTask::MediaState(_) => "media-state",
        }
    }
}

struct ActiveCall {
    room_id: String,
    interview_id: String,
    /// Restarts since the last connected peer
    restarts: u32,
}

/// One interview call: signaling, negotiation, local devices and recording
///
/// Inbound signals, presence changes and reconnects are fed through a single
/// driver task so the PeerConnection sees them in the order they arrived.
pub struct CallSession {
    inner: Arc<CallInner>,
    driver: JoinHandle<()>,
}

struct CallInner {
    config: Config,
    transport: SignalingTransport,
    negotiator: Negotiator,
    devices: DeviceManager,
    recorder: RecordingPipeline,
    sink: Arc<dyn ArtifactSink>,
    events: Arc<EventDispatcher<CallEvent>>,
    /// Serializes join, leave and driver work
    call: tokio::sync::Mutex<Option<ActiveCall>>,
    subscriptions: parking_lot::Mutex<Vec<Subscription>>,
}

impl CallSession {
    pub fn new(config: Config, deps: CallDeps) -> Self {
        let inner = Arc::new(CallInner {
            transport: SignalingTransport::new(config.signaling.clone(), deps.connector),
            negotiator: Negotiator::new(deps.bindings),
            devices: DeviceManager::new(deps.media),
            recorder: RecordingPipeline::new(config.recording.clone(), deps.encoder),
            sink: deps.sink,
            events: Arc::new(EventDispatcher::new("call")),
            call: tokio::sync::Mutex::new(None),
            subscriptions: parking_lot::Mutex::new(Vec::new()),
            config,
        });

        let (tx, rx) = mpsc::unbounded_channel();
        inner.wire(tx);
        let driver = tokio::spawn(drive(Arc::downgrade(&inner), rx));

        Self { inner, driver }
    }

    /// Open the signaling session for `identity`
    pub async fn connect(&self, identity: &str) -> Result<(), CallError> {
        Ok(self.inner.transport.connect(identity).await?)
    }

    /// Leave any call, release local devices and close signaling
    pub async fn disconnect(&self) {
        self.leave().await;
        self.inner.devices.shutdown();
        self.inner.transport.disconnect().await;
    }

    /// Join `room_id` and start negotiating with whoever is (or will be) there
    pub async fn join(&self, room_id: &str, interview_id: &str) -> Result<Room, CallError> {
        let inner = &self.inner;
        let mut call = inner.call.lock().await;

        if let Some(active) = call.as_ref() {
            if active.room_id != room_id {
                return Err(TransportError::AlreadyInRoom(active.room_id.clone()).into());
            }
            return inner.transport.room().ok_or(CallError::NotJoined);
        }

        let room = inner.transport.join_room(room_id, interview_id).await?;
        let local = inner
            .devices
            .start(inner.config.devices.start_audio, inner.config.devices.start_video)
            .await;

        let peer = match inner.negotiator.initialize(room.role, &local).await {
            Ok(peer) => peer,
            Err(e) => {
                error!("Negotiation setup for room {} failed: {}", room_id, e);
                inner.devices.shutdown();
                inner.transport.leave_room(room_id).await;
                return Err(e.into());
            }
        };
        inner.devices.attach(peer.clone());

        *call = Some(ActiveCall {
            room_id: room.room_id.clone(),
            interview_id: room.interview_id.clone(),
            restarts: 0,
        });

        if room.role == Role::Offerer && room.has_peers() {
            if let Err(e) = inner.offer(&peer).await {
                inner.report(e);
            }
        }

        info!(
            "Call joined: room {} as {:?} ({} other participants)",
            room.room_id,
            room.role,
            room.roster.len()
        );
        Ok(room)
    }

    /// Hang up. Calling it again, or outside a call, does nothing.
    pub async fn leave(&self) {
        let inner = &self.inner;
        let mut call = inner.call.lock().await;
        let Some(active) = call.take() else {
            debug!("leave() ignored: no active call");
            return;
        };

        inner.teardown(&active.interview_id).await;
        inner.transport.leave_room(&active.room_id).await;
        info!("Call in room {} left", active.room_id);
    }

    /// Send a chat message; resolves once the relay confirmed delivery
    pub async fn send_chat(&self, text: &str) -> Result<SendOutcome, CallError> {
        self.inner.require_call().await?;
        Ok(self
            .inner
            .transport
            .send(SignalPayload::ChatMessage {
                text: text.to_string(),
            })
            .await?)
    }

    pub async fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        self.inner.devices.toggle(kind, enabled).await
    }

    pub async fn switch_device(&self, kind: TrackKind, device_id: &str) -> bool {
        self.inner.devices.switch_device(kind, device_id).await
    }

    /// Record the local stream and whatever the remote peer sends
    pub async fn start_recording(&self) -> Result<RecordingInfo, CallError> {
        let inner = &self.inner;
        inner.require_call().await?;

        let local = inner.devices.local_stream();
        let remote = inner.negotiator.peer().map(|peer| peer.remote_stream());

        Ok(inner.recorder.start(Some(local), remote).await?)
    }

    pub async fn pause_recording(&self) -> Result<(), CallError> {
        Ok(self.inner.recorder.pause().await?)
    }

    pub async fn resume_recording(&self) -> Result<(), CallError> {
        Ok(self.inner.recorder.resume().await?)
    }

    /// Stop recording and hand the artifact to the sink
    pub async fn stop_recording(&self) -> Result<SavedRecording, CallError> {
        let inner = &self.inner;
        let interview_id = inner
            .call
            .lock()
            .await
            .as_ref()
            .map(|active| active.interview_id.clone());

        let artifact = inner.recorder.stop().await?;
        Ok(inner.save(artifact, interview_id).await)
    }

    pub fn status(&self) -> CallStatus {
        let inner = &self.inner;
        CallStatus {
            connection: inner.transport.status(),
            session: inner.transport.session(),
            room: inner.transport.room(),
            negotiation: inner.negotiator.state(),
            media: inner.devices.media_state(),
            recording: inner.recorder.state(),
            recording_duration_ms: inner.recorder.duration().as_millis() as u64,
        }
    }

    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&CallEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    pub fn events(&self) -> &Arc<EventDispatcher<CallEvent>> {
        &self.inner.events
    }

    pub fn transport(&self) -> &SignalingTransport {
        &self.inner.transport
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.inner.negotiator
    }

    pub fn devices(&self) -> &DeviceManager {
        &self.inner.devices
    }

    pub fn recorder(&self) -> &RecordingPipeline {
        &self.inner.recorder
    }
}

impl Drop for CallSession {
    fn drop(&mut self) {
        self.driver.abort();
        let inner = &self.inner;
        let subscriptions: Vec<Subscription> = inner.subscriptions.lock().drain(..).collect();
        for subscription in subscriptions {
            // Each component only knows its own handlers
            let _ = inner.transport.unsubscribe(subscription)
                || inner.negotiator.unsubscribe(subscription)
                || inner.devices.unsubscribe(subscription)
                || inner.recorder.unsubscribe(subscription);
        }
    }
}

async fn drive(inner: Weak<CallInner>, mut rx: mpsc::UnboundedReceiver<CallTask>) {
    while let Some(task) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.handle(task).await;
    }
    debug!("Call driver stopped");
}

impl CallInner {
    /// Subscribe to every component; handlers only forward, the driver does the work
    fn wire(&self, tx: mpsc::UnboundedSender<CallTask>) {
        let mut subscriptions = self.subscriptions.lock();

        let events = self.events.clone();
        let task_tx = tx.clone();
        subscriptions.push(self.transport.events().subscribe_all(move |event| {
            let task = match event {
                TransportEvent::StatusChanged(status) => {
                    events.emit(CallEvent::ConnectionState(*status));
                    return Ok(());
                }
                TransportEvent::Reconnecting { attempt, delay } => {
                    events.emit(CallEvent::Reconnecting {
                        attempt: *attempt,
                        delay: *delay,
                    });
                    return Ok(());
                }
                TransportEvent::Reconnected { .. } => CallTask::Reconnected,
                TransportEvent::ReconnectFailed { last_error, .. } => CallTask::RoomGone {
                    room_id: String::new(),
                    reason: format!("signaling gave up: {}", last_error),
                },
                TransportEvent::RoomEnded { room_id } => CallTask::RoomGone {
                    room_id: room_id.clone(),
                    reason: "room ended".to_string(),
                },
                TransportEvent::Presence(update) => CallTask::Presence(update.clone()),
                TransportEvent::Signal(envelope) => CallTask::Signal(envelope.clone()),
                _ => return Ok(()),
            };
            task_tx.send(task)?;
            Ok(())
        }));

        let events = self.events.clone();
        let task_tx = tx.clone();
        subscriptions.push(self.negotiator.events().subscribe_all(move |event| {
            match event {
                NegotiationEvent::StateChanged { peer_id, state } => {
                    events.emit(CallEvent::PeerState(*state));
                    if *state == NegotiationState::Connected {
                        task_tx.send(CallTask::PeerConnected {
                            peer_id: peer_id.clone(),
                        })?;
                    }
                }
                NegotiationEvent::Terminated {
                    peer_id,
                    state,
                    reason,
                } => {
                    warn!("Peer connection ended ({:?}): {}", state, reason);
                    events.emit(CallEvent::PeerState(*state));
                    task_tx.send(CallTask::PeerTerminated {
                        peer_id: peer_id.clone(),
                    })?;
                }
                NegotiationEvent::RemoteTrack { stream, .. } => {
                    events.emit(CallEvent::RemoteStreamAvailable(stream.clone()));
                }
                NegotiationEvent::LocalCandidate { peer_id, candidate } => {
                    task_tx.send(CallTask::LocalCandidate {
                        peer_id: peer_id.clone(),
                        candidate: candidate.clone(),
                    })?;
                }
            }
            Ok(())
        }));

        let events = self.events.clone();
        let task_tx = tx;
        subscriptions.push(self.devices.events().subscribe_all(move |event| {
            match event {
                DeviceEvent::MediaStateChanged(state) => {
                    task_tx.send(CallTask::MediaState(*state))?;
                }
                DeviceEvent::Error(e) => {
                    events.emit(CallEvent::Error(e.clone().into()));
                }
                DeviceEvent::TrackReplaced { .. } => {}
            }
            Ok(())
        }));

        let events = self.events.clone();
        subscriptions.push(self.recorder.events().subscribe_all(move |event| {
            match event {
                RecordingEvent::StateChanged(state) => {
                    events.emit(CallEvent::RecordingState(*state));
                }
                RecordingEvent::Error(e) => {
                    events.emit(CallEvent::Error(e.clone().into()));
                }
            }
            Ok(())
        }));
    }

    async fn require_call(&self) -> Result<(), CallError> {
        match self.call.lock().await.as_ref() {
            Some(_) => Ok(()),
            None => Err(CallError::NotJoined),
        }
    }

    fn report(&self, e: CallError) {
        warn!("Call error: {}", e);
        self.events.emit(CallEvent::Error(e));
    }

    async fn handle(&self, task: CallTask) {
        let mut call = self.call.lock().await;
        let Some(active) = call.as_mut() else {
            debug!("Dropping {} outside a call", task.kind());
            return;
        };

        let result = match task {
            CallTask::RoomGone { room_id, reason } => {
                if !room_id.is_empty() && room_id != active.room_id {
                    return;
                }
                let room_id = active.room_id.clone();
                let interview_id = active.interview_id.clone();
                info!("Call in room {} ended: {}", room_id, reason);
                *call = None;
                self.teardown(&interview_id).await;
                self.events.emit(CallEvent::CallEnded { room_id, reason });
                Ok(())
            }
            CallTask::Signal(envelope) => self.on_signal(envelope).await,
            CallTask::Presence(update) => self.on_presence(update).await,
            CallTask::Reconnected => self.on_reconnected().await,
            CallTask::LocalCandidate { peer_id, candidate } => {
                self.send_candidate(&peer_id, candidate).await
            }
            CallTask::PeerConnected { peer_id } => {
                if self.is_current(&peer_id) {
                    active.restarts = 0;
                }
                Ok(())
            }
            CallTask::PeerTerminated { peer_id } => self.on_peer_terminated(active, &peer_id).await,
            CallTask::MediaState(state) => self
                .transport
                .send(SignalPayload::MediaState {
                    audio_enabled: state.audio_enabled,
                    video_enabled: state.video_enabled,
                })
                .await
                .map(|_| ())
                .map_err(CallError::from),
        };

        if let Err(e) = result {
            self.report(e);
        }
    }

    async fn on_signal(&self, envelope: SignalEnvelope) -> Result<(), CallError> {
        let sender = envelope.sender;
        match envelope.payload {
            SignalPayload::Offer { sdp } => {
                let mut peer = self.current_peer()?;
                if peer.role() == Role::Answerer && peer.state() != NegotiationState::Initializing {
                    if let Some(answer) = repeated_exchange(&peer, &sdp).await {
                        // The offerer repeated an offer we already answered
                        debug!("Repeating answer for {}", sender);
                        self.transport
                            .send(SignalPayload::Answer { sdp: answer.sdp })
                            .await?;
                        return Ok(());
                    }
                    // The offerer started over, follow it
                    peer = self.renegotiate("new offer received").await?;
                }
                let answer = peer
                    .handle_remote_offer(SessionDescription::offer(sdp))
                    .await?;
                self.transport
                    .send(SignalPayload::Answer { sdp: answer.sdp })
                    .await?;
                debug!("Answered offer from {}", sender);
            }
            SignalPayload::Answer { sdp } => {
                let peer = self.current_peer()?;
                if peer.state() != NegotiationState::OfferSent
                    && repeated_exchange(&peer, &sdp).await.is_some()
                {
                    debug!("Ignoring repeated answer from {}", sender);
                    return Ok(());
                }
                peer.handle_remote_answer(SessionDescription::answer(sdp))
                    .await?;
                debug!("Applied answer from {}", sender);
            }
            SignalPayload::Ready => {
                let peer = self.current_peer()?;
                if peer.role() != Role::Offerer {
                    debug!("Ignoring ready from {} as {:?}", sender, peer.role());
                    return Ok(());
                }
                info!("{} started over and waits for an offer", sender);
                let peer = match peer.state() {
                    NegotiationState::Initializing | NegotiationState::OfferSent => peer,
                    _ => self.renegotiate("remote participant started over").await?,
                };
                self.offer_or_repeat(&peer).await?;
            }
            SignalPayload::Candidate(candidate) => {
                self.current_peer()?.add_remote_candidate(candidate).await?;
            }
            SignalPayload::ChatMessage { text } => {
                self.events.emit(CallEvent::ChatMessage { sender, text });
            }
            SignalPayload::MediaState {
                audio_enabled,
                video_enabled,
            } => {
                self.events.emit(CallEvent::RemoteMediaState {
                    sender,
                    state: MediaState {
                        audio_enabled,
                        video_enabled,
                    },
                });
            }
        }
        Ok(())
    }

    async fn on_presence(&self, update: PresenceUpdate) -> Result<(), CallError> {
        let peer = self.current_peer()?;

        if update.joined {
            info!("{} joined room {}", update.peer, update.room_id);
            if peer.role() == Role::Offerer {
                let peer = match peer.state() {
                    NegotiationState::Initializing => peer,
                    _ => self.renegotiate("new participant joined").await?,
                };
                self.offer(&peer).await?;
            }
            return Ok(());
        }

        info!("{} left room {}", update.peer, update.room_id);
        if peer.state() != NegotiationState::Initializing {
            self.renegotiate("remote participant left").await?;
        }
        Ok(())
    }

    async fn on_reconnected(&self) -> Result<(), CallError> {
        let peer = match self.negotiator.peer() {
            Some(peer) if peer.is_connected() => {
                debug!("Peer connection survived the signaling outage");
                return Ok(());
            }
            Some(peer) if peer.state() == NegotiationState::Initializing => peer,
            _ => self.renegotiate("signaling reconnected").await?,
        };
        self.resume_handshake(&peer).await
    }

    /// The current peer failed or closed on its own. Start over while the
    /// room is reachable; a signaling outage is left to `on_reconnected`.
    async fn on_peer_terminated(
        &self,
        active: &mut ActiveCall,
        peer_id: &str,
    ) -> Result<(), CallError> {
        if !self.is_current(peer_id) {
            debug!("Ignoring end of replaced peer {}", peer_id);
            return Ok(());
        }
        if self.transport.status() != ConnectionStatus::Connected {
            info!("Peer {} ended during a signaling outage, waiting for reconnect", peer_id);
            return Ok(());
        }
        if active.restarts >= MAX_PEER_RESTARTS {
            return Err(CallError::RestartsExhausted(active.restarts));
        }

        active.restarts += 1;
        let peer = self.renegotiate("peer connection ended").await?;
        self.resume_handshake(&peer).await
    }

    /// Ask the other side to (re)start the handshake with a fresh peer
    async fn resume_handshake(&self, peer: &PeerConnection) -> Result<(), CallError> {
        match (peer.role(), peer.state()) {
            (Role::Offerer, NegotiationState::Initializing) => {
                if self.transport.room().map_or(false, |room| room.has_peers()) {
                    self.offer(peer).await?;
                }
            }
            (Role::Offerer, NegotiationState::OfferSent) => self.offer_or_repeat(peer).await?,
            (Role::Answerer, NegotiationState::Initializing) => {
                self.transport.send(SignalPayload::Ready).await?;
                info!("Peer {} ready for a new offer", peer.id());
            }
            _ => {}
        }
        Ok(())
    }

    async fn send_candidate(
        &self,
        peer_id: &str,
        candidate: IceCandidate,
    ) -> Result<(), CallError> {
        let current = self.negotiator.peer();
        if current.map_or(true, |peer| peer.id() != peer_id) {
            debug!("Dropping candidate of stale peer {}", peer_id);
            return Ok(());
        }
        self.transport
            .send(SignalPayload::Candidate(candidate))
            .await?;
        Ok(())
    }

    fn current_peer(&self) -> Result<Arc<PeerConnection>, CallError> {
        self.negotiator.peer().ok_or(CallError::NotJoined)
    }

    fn is_current(&self, peer_id: &str) -> bool {
        self.negotiator
            .peer()
            .map_or(false, |peer| peer.id() == peer_id)
    }

    async fn offer(&self, peer: &PeerConnection) -> Result<(), CallError> {
        let offer = peer.create_offer().await?;
        self.transport
            .send(SignalPayload::Offer { sdp: offer.sdp })
            .await?;
        info!("Offer sent for peer {}", peer.id());
        Ok(())
    }

    /// Offer from a fresh peer, or send the outstanding offer again
    async fn offer_or_repeat(&self, peer: &PeerConnection) -> Result<(), CallError> {
        if peer.state() == NegotiationState::Initializing {
            return self.offer(peer).await;
        }
        if let Some(offer) = peer.local_description().await {
            self.transport
                .send(SignalPayload::Offer { sdp: offer.sdp })
                .await?;
            debug!("Offer repeated for peer {}", peer.id());
        }
        Ok(())
    }

    /// Replace the PeerConnection with a fresh one for the current role
    ///
    /// The new peer is left in Initializing; callers decide who speaks first.
    async fn renegotiate(&self, reason: &str) -> Result<Arc<PeerConnection>, CallError> {
        let room = self.transport.room().ok_or(CallError::NotJoined)?;
        info!(
            "Renegotiating in room {} as {:?}: {}",
            room.room_id, room.role, reason
        );

        self.finish_recording(&room.interview_id).await;
        self.devices.detach();

        let peer = self
            .negotiator
            .initialize(room.role, &self.devices.local_stream())
            .await?;
        self.devices.attach(peer.clone());
        Ok(peer)
    }

    /// Stop recording, close the peer and release the peer from the devices
    async fn teardown(&self, interview_id: &str) {
        self.finish_recording(interview_id).await;
        self.devices.detach();
        self.negotiator.close().await;
    }

    async fn finish_recording(&self, interview_id: &str) {
        if self.recorder.state() == RecordingState::Inactive {
            return;
        }
        match self.recorder.stop().await {
            Ok(artifact) => {
                self.save(artifact, Some(interview_id.to_string())).await;
            }
            Err(e) => self.report(e.into()),
        }
    }

    async fn save(&self, mut artifact: Artifact, interview_id: Option<String>) -> SavedRecording {
        artifact.interview_id = interview_id;
        let location = match self.sink.store(&artifact).await {
            Ok(location) => {
                info!(
                    "Recording {} stored by {} sink at {}",
                    artifact.recording_id,
                    self.sink.name(),
                    location
                );
                Some(location)
            }
            Err(e) => {
                self.report(e.into());
                None
            }
        };
        SavedRecording { artifact, location }
    }
}

/// Local description of `peer` if `remote_sdp` is the description it already applied
async fn repeated_exchange(peer: &PeerConnection, remote_sdp: &str) -> Option<SessionDescription> {
    if peer.state().is_terminal() {
        return None;
    }
    let remote = peer.remote_description().await?;
    if remote.sdp != remote_sdp {
        return None;
    }
    peer.local_description().await
}
