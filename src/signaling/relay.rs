use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::messages::{InboundFrame, OutboundFrame, RelayReply};
use crate::error::TransportError;

/// Capacity of the inbound frame queue of one link
pub const LINK_CHANNEL_CAPACITY: usize = 256;

/// What a live relay link delivers to the transport
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Frame(InboundFrame),
    /// The link is gone; the transport decides whether to reconnect
    Closed(String),
}

/// One established connection to the relay
///
/// `inbound` ends (returns None) or yields `Closed` when the connection
/// drops. The sender half stays usable until then.
pub struct RelayLink {
    pub sender: Arc<dyn RelaySender>,
    pub inbound: mpsc::Receiver<LinkEvent>,
}

/// Opens relay connections for an identity token
#[async_trait]
pub trait RelayConnector: Send + Sync {
    async fn connect(&self, identity: &str) -> Result<RelayLink, TransportError>;

    /// Connector name for logging
    fn name(&self) -> &str;
}

/// Outbound half of a relay link
#[async_trait]
pub trait RelaySender: Send + Sync {
    /// Fire-and-forget delivery
    async fn publish(&self, frame: &OutboundFrame) -> Result<(), TransportError>;

    /// Request/response delivery, failing with `AckTimeout` after `timeout`
    async fn request(
        &self,
        frame: &OutboundFrame,
        timeout: Duration,
    ) -> Result<RelayReply, TransportError>;

    /// Start receiving frames fanned out to `room_id`
    async fn watch_room(&self, room_id: &str) -> Result<(), TransportError>;

    async fn unwatch_room(&self, room_id: &str);

    async fn close(&self);
}
