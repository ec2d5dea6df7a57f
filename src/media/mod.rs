pub mod codec;
pub mod devices;
pub mod ffmpeg;
pub mod ogg;
pub mod source;
pub mod stream;
pub mod track;

pub use codec::{CodecFactory, FrameFormat, MediaFrame, SampleDecoder, SampleEncoder};
pub use devices::{DeviceEvent, DeviceManager, MediaState};
pub use ffmpeg::{codec_factory, ffmpeg_available, FfmpegCodecFactory};
pub use source::{DeviceInfo, MediaSource, SyntheticSource};
pub use stream::MediaStream;
pub use track::{AudioFrame, EncodedSample, MediaTrack, StreamOrigin, TrackKind, VideoFrame};
