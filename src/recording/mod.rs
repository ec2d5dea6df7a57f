pub mod compositor;
pub mod encoder;
pub mod ffmpeg;
pub mod mixer;
pub mod pipeline;
pub mod sink;
pub mod state;

pub use compositor::{Compositor, Layout, SoftwareCompositor};
pub use encoder::{
    encoder_factory, EncodedOutput, EncoderFactory, MediaEncoder, WavEncoder, WavEncoderFactory,
};
pub use ffmpeg::{FfmpegEncoder, FfmpegEncoderFactory};
pub use mixer::{AudioMixer, MixerConfig};
pub use pipeline::{RecordingEvent, RecordingInfo, RecordingPipeline};
pub use sink::{Artifact, ArtifactSink, FileArtifactSink};
pub use state::{DurationClock, RecordingState};
