use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::backoff::Backoff;
use super::messages::{
    DeliveryAck, InboundFrame, JoinRequest, LeaveNotice, OutboundFrame, PresenceUpdate,
    RelayReply, SignalEnvelope, SignalPayload,
};
use super::relay::{LinkEvent, RelayConnector, RelaySender};
use super::room::Room;
use crate::config::SignalingConfig;
use crate::error::TransportError;
use crate::events::{Event, EventDispatcher, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Authenticated connection of one identity to the relay
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub identity: String,
    pub status: ConnectionStatus,
    /// Reconnect attempts over the whole session, never reset
    pub reconnect_attempts: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

impl Session {
    fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            status: ConnectionStatus::Disconnected,
            reconnect_attempts: 0,
            connected_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StatusChanged(ConnectionStatus),
    Reconnecting { attempt: u32, delay: Duration },
    /// `attempt_number` counts attempts of the outage that just ended
    Reconnected { attempt_number: u32 },
    /// Terminal: the transport gave up and is disconnected
    ReconnectFailed { attempts: u32, last_error: String },
    RoomJoined(Room),
    RoomRejoined(Room),
    RoomLeft { room_id: String },
    RoomEnded { room_id: String },
    Presence(PresenceUpdate),
    /// Named after its payload ("offer", "candidate", ...)
    Signal(SignalEnvelope),
}

impl Event for TransportEvent {
    fn name(&self) -> &'static str {
        match self {
            TransportEvent::StatusChanged(_) => "status-changed",
            TransportEvent::Reconnecting { .. } => "reconnecting",
            TransportEvent::Reconnected { .. } => "reconnected",
            TransportEvent::ReconnectFailed { .. } => "reconnect-failed",
            TransportEvent::RoomJoined(_) => "room-joined",
            TransportEvent::RoomRejoined(_) => "room-rejoined",
            TransportEvent::RoomLeft { .. } => "room-left",
            TransportEvent::RoomEnded { .. } => "room-ended",
            TransportEvent::Presence(_) => "presence",
            TransportEvent::Signal(envelope) => envelope.payload.event_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Fire-and-forget payload handed to the relay
    Sent,
    /// Acknowledged payload confirmed by the relay
    Acknowledged(DeliveryAck),
}

/// Session-level signaling client
///
/// Owns one relay link at a time. After an established link drops, a
/// supervisor task reconnects with exponential backoff and replays the room
/// join before the new link becomes visible to `send`.
pub struct SignalingTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: SignalingConfig,
    connector: Arc<dyn RelayConnector>,
    events: Arc<EventDispatcher<TransportEvent>>,
    /// Serializes connect, disconnect, join, leave and link replacement
    link: tokio::sync::Mutex<Option<Arc<dyn RelaySender>>>,
    session: RwLock<Option<Session>>,
    room: RwLock<Option<Room>>,
    backoff: Mutex<Backoff>,
    cancel: Mutex<Option<CancellationToken>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingTransport {
    pub fn new(config: SignalingConfig, connector: Arc<dyn RelayConnector>) -> Self {
        info!(
            "Signaling transport using {} relay (connect timeout {:?}, max reconnects {})",
            connector.name(),
            config.connect_timeout(),
            config.max_reconnect_attempts
        );

        let backoff = Backoff::from_config(&config);

        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                events: Arc::new(EventDispatcher::new("signaling")),
                link: tokio::sync::Mutex::new(None),
                session: RwLock::new(None),
                room: RwLock::new(None),
                backoff: Mutex::new(backoff),
                cancel: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    /// Open the session for `identity`
    ///
    /// A failure here is returned to the caller; only links that were
    /// established once are retried automatically.
    pub async fn connect(&self, identity: &str) -> Result<(), TransportError> {
        let inner = &self.inner;
        let mut link = inner.link.lock().await;

        if inner.status() != ConnectionStatus::Disconnected {
            debug!("connect({}) ignored: session already active", identity);
            return Ok(());
        }

        *inner.session.write() = Some(Session::new(identity));
        inner.set_status(ConnectionStatus::Connecting);

        let connected =
            tokio::time::timeout(inner.config.connect_timeout(), inner.connector.connect(identity))
                .await
                .map_err(|_| TransportError::Timeout(inner.config.connect_timeout()))
                .and_then(|result| result);

        let relay_link = match connected {
            Ok(relay_link) => relay_link,
            Err(e) => {
                warn!("Connect to relay failed: {}", e);
                inner.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        *link = Some(relay_link.sender);
        inner.backoff.lock().reset();

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            inner.clone(),
            relay_link.inbound,
            cancel.clone(),
        ));
        *inner.cancel.lock() = Some(cancel);
        *inner.supervisor.lock() = Some(handle);

        if let Some(session) = inner.session.write().as_mut() {
            session.connected_at = Some(Utc::now());
        }
        inner.set_status(ConnectionStatus::Connected);

        info!("Signaling session established for {}", identity);
        Ok(())
    }

    /// Close the session, cancelling any reconnect in progress
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.stop_supervisor();

        let mut link = inner.link.lock().await;
        let room = inner.room.write().take();

        if let Some(sender) = link.take() {
            if let Some(room) = room {
                let notice = OutboundFrame::Leave(LeaveNotice {
                    room_id: room.room_id.clone(),
                    identity: inner.identity(),
                });
                if let Err(e) = sender.publish(&notice).await {
                    debug!("Leave notice for {} not delivered: {}", room.room_id, e);
                }
            }
            sender.close().await;
        }

        if inner.status() != ConnectionStatus::Disconnected {
            inner.set_status(ConnectionStatus::Disconnected);
            info!("Signaling session closed");
        }
    }

    /// Join `room_id`; the relay's response decides this session's role
    pub async fn join_room(
        &self,
        room_id: &str,
        interview_id: &str,
    ) -> Result<Room, TransportError> {
        let inner = &self.inner;
        let link = inner.link.lock().await;
        let sender = link.clone().ok_or(TransportError::NotConnected)?;

        let current = inner.room.read().as_ref().map(|r| r.room_id.clone());
        if let Some(current) = current {
            if current != room_id {
                return Err(TransportError::AlreadyInRoom(current));
            }
        }

        let room = inner.join_with(&sender, room_id, interview_id).await?;

        info!("Joined room {} as {:?}", room.room_id, room.role);
        inner.events.emit(TransportEvent::RoomJoined(room.clone()));

        Ok(room)
    }

    /// Leave `room_id`. Leaving a room that is not joined is a no-op.
    pub async fn leave_room(&self, room_id: &str) {
        let inner = &self.inner;
        let link = inner.link.lock().await;

        let is_current = inner
            .room
            .read()
            .as_ref()
            .map_or(false, |r| r.room_id == room_id);
        if !is_current {
            debug!("leave_room({}) ignored: not joined", room_id);
            return;
        }
        *inner.room.write() = None;

        if let Some(sender) = link.as_ref() {
            let notice = OutboundFrame::Leave(LeaveNotice {
                room_id: room_id.to_string(),
                identity: inner.identity(),
            });
            if let Err(e) = sender.publish(&notice).await {
                warn!("Leave notice for {} not delivered: {}", room_id, e);
            }
            sender.unwatch_room(room_id).await;
        }

        info!("Left room {}", room_id);
        inner.events.emit(TransportEvent::RoomLeft {
            room_id: room_id.to_string(),
        });
    }

    /// Send `payload` to the current room
    ///
    /// Chat messages wait for the relay's acknowledgment; everything else is
    /// fire-and-forget. Fails with `NotConnected` while reconnecting.
    pub async fn send(&self, payload: SignalPayload) -> Result<SendOutcome, TransportError> {
        let inner = &self.inner;
        let sender = inner
            .link
            .lock()
            .await
            .clone()
            .ok_or(TransportError::NotConnected)?;
        let room = inner
            .room
            .read()
            .clone()
            .ok_or_else(|| TransportError::NotInRoom("(none)".to_string()))?;

        let envelope = SignalEnvelope {
            room_id: room.room_id,
            interview_id: room.interview_id,
            role: room.role,
            sender: inner.identity(),
            message_id: Uuid::new_v4().to_string(),
            payload,
        };
        let kind = envelope.payload.event_name();

        if !envelope.payload.requires_ack() {
            sender.publish(&OutboundFrame::Signal(envelope)).await?;
            debug!("Sent {}", kind);
            return Ok(SendOutcome::Sent);
        }

        match sender
            .request(&OutboundFrame::Signal(envelope), inner.config.ack_timeout())
            .await?
        {
            RelayReply::Delivered(ack) => {
                debug!("Sent {} (ack {})", kind, ack.message_id);
                Ok(SendOutcome::Acknowledged(ack))
            }
            RelayReply::Rejected { reason } => Err(TransportError::Rejected(reason)),
            RelayReply::Joined(_) => Err(TransportError::Protocol(format!(
                "unexpected join response to {}",
                kind
            ))),
        }
    }

    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&TransportEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.inner.events.unsubscribe(subscription)
    }

    pub fn events(&self) -> &Arc<EventDispatcher<TransportEvent>> {
        &self.inner.events
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.session.read().clone()
    }

    pub fn room(&self) -> Option<Room> {
        self.inner.room.read().clone()
    }
}

impl Drop for SignalingTransport {
    fn drop(&mut self) {
        self.inner.stop_supervisor();
    }
}

impl Inner {
    fn status(&self) -> ConnectionStatus {
        self.session
            .read()
            .as_ref()
            .map_or(ConnectionStatus::Disconnected, |s| s.status)
    }

    fn identity(&self) -> String {
        self.session
            .read()
            .as_ref()
            .map(|s| s.identity.clone())
            .unwrap_or_default()
    }

    fn set_status(&self, status: ConnectionStatus) {
        let changed = match self.session.write().as_mut() {
            Some(session) if session.status != status => {
                session.status = status;
                true
            }
            _ => false,
        };
        if changed {
            self.events.emit(TransportEvent::StatusChanged(status));
        }
    }

    fn stop_supervisor(&self) {
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        if let Some(handle) = self.supervisor.lock().take() {
            handle.abort();
        }
    }

    async fn join_with(
        &self,
        sender: &Arc<dyn RelaySender>,
        room_id: &str,
        interview_id: &str,
    ) -> Result<Room, TransportError> {
        let request = OutboundFrame::Join(JoinRequest {
            room_id: room_id.to_string(),
            interview_id: interview_id.to_string(),
            identity: self.identity(),
        });

        match sender.request(&request, self.config.ack_timeout()).await? {
            RelayReply::Joined(response) => {
                // Recorded before watching so presence frames find the room
                let room = Room::from_join(response, interview_id);
                *self.room.write() = Some(room.clone());
                if let Err(e) = sender.watch_room(room_id).await {
                    *self.room.write() = None;
                    return Err(e);
                }
                Ok(room)
            }
            RelayReply::Rejected { reason } => Err(TransportError::Rejected(reason)),
            RelayReply::Delivered(_) => Err(TransportError::Protocol(
                "join answered without a role".to_string(),
            )),
        }
    }

    fn dispatch(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Signal(envelope) => {
                if envelope.sender == self.identity() {
                    return;
                }
                let in_room = self
                    .room
                    .read()
                    .as_ref()
                    .map_or(false, |r| r.room_id == envelope.room_id);
                if !in_room {
                    debug!(
                        "Dropping {} for room {}: not joined",
                        envelope.payload.event_name(),
                        envelope.room_id
                    );
                    return;
                }
                self.events.emit(TransportEvent::Signal(envelope));
            }
            InboundFrame::Presence(update) => {
                if update.peer == self.identity() {
                    return;
                }
                let changed = self
                    .room
                    .write()
                    .as_mut()
                    .map_or(false, |room| room.apply_presence(&update));
                if changed {
                    self.events.emit(TransportEvent::Presence(update));
                }
            }
            InboundFrame::RoomEnded { room_id } => {
                let ended = {
                    let mut room = self.room.write();
                    if room.as_ref().map_or(false, |r| r.room_id == room_id) {
                        room.take().is_some()
                    } else {
                        false
                    }
                };
                if ended {
                    info!("Room {} ended by relay", room_id);
                    self.events.emit(TransportEvent::RoomEnded { room_id });
                }
            }
        }
    }

    /// Run the backoff loop until a new link is up, the session is cancelled
    /// or the attempt budget is spent
    async fn reconnect(&self, cancel: &CancellationToken) -> Option<mpsc::Receiver<LinkEvent>> {
        if let Some(stale) = self.link.lock().await.take() {
            stale.close().await;
        }
        if cancel.is_cancelled() {
            return None;
        }
        self.set_status(ConnectionStatus::Reconnecting);

        let max_attempts = self.config.max_reconnect_attempts;
        let mut attempt = 0u32;
        let mut last_error = String::new();

        loop {
            if max_attempts > 0 && attempt >= max_attempts {
                break;
            }
            attempt += 1;

            let delay = self.backoff.lock().next_delay();
            if let Some(session) = self.session.write().as_mut() {
                session.reconnect_attempts += 1;
            }

            info!("Reconnect attempt {} in {:?}", attempt, delay);
            self.events
                .emit(TransportEvent::Reconnecting { attempt, delay });

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                outcome = async {
                    tokio::time::sleep(delay).await;
                    self.try_reconnect().await
                } => outcome,
            };

            match outcome {
                Ok((inbound, rejoined)) => {
                    self.backoff.lock().reset();
                    if let Some(session) = self.session.write().as_mut() {
                        session.connected_at = Some(Utc::now());
                    }
                    self.set_status(ConnectionStatus::Connected);

                    info!("Reconnected to relay after {} attempt(s)", attempt);
                    if let Some(room) = rejoined {
                        self.events.emit(TransportEvent::RoomRejoined(room));
                    }
                    self.events.emit(TransportEvent::Reconnected {
                        attempt_number: attempt,
                    });
                    return Some(inbound);
                }
                Err(e) if !e.is_retryable() => {
                    error!("Reconnect attempt {} rejected: {}", attempt, e);
                    last_error = e.to_string();
                    break;
                }
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {}", attempt, e);
                    last_error = e.to_string();
                }
            }
        }

        error!(
            "Giving up on relay after {} reconnect attempt(s): {}",
            attempt, last_error
        );
        self.cancel.lock().take();
        *self.room.write() = None;
        self.set_status(ConnectionStatus::Disconnected);
        self.events.emit(TransportEvent::ReconnectFailed {
            attempts: attempt,
            last_error,
        });
        None
    }

    /// One connect attempt plus room replay
    ///
    /// The new sender is published only after the rejoin, so a send can
    /// never reach the room on a link that has not rejoined it.
    async fn try_reconnect(
        &self,
    ) -> Result<(mpsc::Receiver<LinkEvent>, Option<Room>), TransportError> {
        let identity = self.identity();
        let relay_link = tokio::time::timeout(
            self.config.connect_timeout(),
            self.connector.connect(&identity),
        )
        .await
        .map_err(|_| TransportError::Timeout(self.config.connect_timeout()))??;

        let mut link = self.link.lock().await;

        let previous = self.room.read().clone();
        let rejoined = match previous {
            Some(room) => {
                match self
                    .join_with(&relay_link.sender, &room.room_id, &room.interview_id)
                    .await
                {
                    Ok(rejoined) => Some(rejoined),
                    Err(e) => {
                        // Keep the room so the next attempt replays it again
                        *self.room.write() = Some(room);
                        relay_link.sender.close().await;
                        return Err(e);
                    }
                }
            }
            None => None,
        };

        *link = Some(relay_link.sender);
        Ok((relay_link.inbound, rejoined))
    }
}

async fn supervise(
    inner: Arc<Inner>,
    mut inbound: mpsc::Receiver<LinkEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = inbound.recv() => event,
        };

        match event {
            Some(LinkEvent::Frame(frame)) => inner.dispatch(frame),
            Some(LinkEvent::Closed(reason)) => {
                warn!("Signaling link lost: {}", reason);
                match inner.reconnect(&cancel).await {
                    Some(next) => inbound = next,
                    None => break,
                }
            }
            None => {
                warn!("Signaling link lost: relay closed the connection");
                match inner.reconnect(&cancel).await {
                    Some(next) => inbound = next,
                    None => break,
                }
            }
        }
    }

    debug!("Signaling supervisor stopped");
}
