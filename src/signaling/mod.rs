pub mod backoff;
pub mod memory;
pub mod messages;
pub mod nats;
pub mod relay;
pub mod room;
pub mod transport;

pub use backoff::Backoff;
pub use memory::MemoryRelay;
pub use messages::{
    DeliveryAck, IceCandidate, InboundFrame, OutboundFrame, PresenceUpdate, RelayReply, Role,
    SignalEnvelope, SignalPayload,
};
pub use nats::NatsRelay;
pub use relay::{LinkEvent, RelayConnector, RelayLink, RelaySender};
pub use room::Room;
pub use transport::{ConnectionStatus, SendOutcome, Session, SignalingTransport, TransportEvent};
