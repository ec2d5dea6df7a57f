use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

use super::binding::PeerBindingFactory;
use super::peer::PeerConnection;
use super::state::NegotiationState;
use super::NegotiationEvent;
use crate::error::NegotiationError;
use crate::events::{EventDispatcher, Subscription};
use crate::media::MediaStream;
use crate::signaling::Role;

/// Owns the PeerConnection of the current room
///
/// At most one connection exists at a time; `initialize` closes the
/// previous one before creating the next.
pub struct Negotiator {
    factory: Arc<dyn PeerBindingFactory>,
    events: Arc<EventDispatcher<NegotiationEvent>>,
    current: RwLock<Option<Arc<PeerConnection>>>,
    init_lock: tokio::sync::Mutex<()>,
}

impl Negotiator {
    pub fn new(factory: Arc<dyn PeerBindingFactory>) -> Self {
        info!("Negotiator using {} peer bindings", factory.name());

        Self {
            factory,
            events: Arc::new(EventDispatcher::new("negotiation")),
            current: RwLock::new(None),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Create a fresh PeerConnection for `role` carrying `local_stream`
    pub async fn initialize(
        &self,
        role: Role,
        local_stream: &MediaStream,
    ) -> Result<Arc<PeerConnection>, NegotiationError> {
        let _guard = self.init_lock.lock().await;

        let previous = self.current.write().take();
        if let Some(previous) = previous {
            info!("Tearing down peer {} before re-initializing", previous.id());
            previous.close().await;
        }

        let (binding, binding_events) = self.factory.create().await?;
        let peer = Arc::new(PeerConnection::new(role, binding, self.events.clone()));
        peer.start_pump(binding_events);

        if let Err(e) = peer.attach_local_tracks(local_stream).await {
            peer.close().await;
            return Err(e);
        }

        info!("Peer {} initialized as {:?}", peer.id(), role);
        *self.current.write() = Some(peer.clone());

        Ok(peer)
    }

    /// Current connection, if any
    pub fn peer(&self) -> Option<Arc<PeerConnection>> {
        self.current.read().clone()
    }

    pub fn state(&self) -> NegotiationState {
        self.peer()
            .map_or(NegotiationState::Idle, |peer| peer.state())
    }

    /// Close and forget the current connection
    pub async fn close(&self) {
        let _guard = self.init_lock.lock().await;
        let previous = self.current.write().take();
        if let Some(peer) = previous {
            peer.close().await;
        }
    }

    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&NegotiationEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    pub fn events(&self) -> &Arc<EventDispatcher<NegotiationEvent>> {
        &self.events
    }
}
