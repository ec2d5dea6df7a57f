pub mod call;
pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod media;
pub mod negotiation;
pub mod recording;
pub mod signaling;

pub use call::{CallDeps, CallEvent, CallSession, CallStatus, SavedRecording};
pub use config::Config;
pub use error::{CallError, CodecError, DeviceError, NegotiationError, RecordingError, TransportError};
pub use events::{Event, EventDispatcher, Subscription};
pub use http::{cors_layer, create_router, AppState};
pub use media::{DeviceManager, MediaSource, MediaStream, MediaTrack, SyntheticSource, TrackKind};
pub use negotiation::{NegotiationState, Negotiator, PeerConnection, WebRtcBindingFactory};
pub use recording::{
    encoder_factory, Artifact, ArtifactSink, FfmpegEncoderFactory, FileArtifactSink,
    RecordingPipeline, RecordingState, WavEncoderFactory,
};
pub use signaling::{MemoryRelay, NatsRelay, Role, SignalingTransport};
