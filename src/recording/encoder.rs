use std::io::Cursor;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::{ContainerFormat, RecordingConfig};
use crate::error::RecordingError;
use crate::media::{AudioFrame, VideoFrame};

/// Finished encoder output
#[derive(Debug, Clone)]
pub struct EncodedOutput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub video_frames: u64,
}

/// Sink for the composited video and mixed audio of one recording
///
/// `FfmpegEncoder` writes WebM or MP4; `WavEncoder` keeps the mixed audio
/// and only counts frames.
pub trait MediaEncoder: Send {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<(), RecordingError>;

    fn write_audio(&mut self, frame: &AudioFrame) -> Result<(), RecordingError>;

    fn finish(self: Box<Self>) -> Result<EncodedOutput, RecordingError>;

    fn mime_type(&self) -> &str;
}

/// Creates one encoder per recording
pub trait EncoderFactory: Send + Sync {
    fn create(&self, config: &RecordingConfig) -> Result<Box<dyn MediaEncoder>, RecordingError>;

    /// Factory name for logging
    fn name(&self) -> &str;
}

fn encoder_err(e: hound::Error) -> RecordingError {
    RecordingError::Encoder(e.to_string())
}

/// 16-bit PCM WAV of the mixed call audio
pub struct WavEncoder {
    spec: hound::WavSpec,
    samples: Vec<i16>,
    video_frames: u64,
}

impl WavEncoder {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            spec: hound::WavSpec {
                channels,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            samples: Vec::new(),
            video_frames: 0,
        }
    }
}

impl MediaEncoder for WavEncoder {
    fn write_video(&mut self, _frame: &VideoFrame) -> Result<(), RecordingError> {
        self.video_frames += 1;
        Ok(())
    }

    fn write_audio(&mut self, frame: &AudioFrame) -> Result<(), RecordingError> {
        if frame.sample_rate != self.spec.sample_rate || frame.channels != self.spec.channels {
            return Err(RecordingError::Encoder(format!(
                "expected {}Hz/{}ch audio, got {}Hz/{}ch",
                self.spec.sample_rate, self.spec.channels, frame.sample_rate, frame.channels
            )));
        }
        self.samples.extend_from_slice(&frame.samples);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<EncodedOutput, RecordingError> {
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, self.spec).map_err(encoder_err)?;
            for sample in &self.samples {
                writer.write_sample(*sample).map_err(encoder_err)?;
            }
            writer.finalize().map_err(encoder_err)?;
        }

        let bytes = cursor.into_inner();
        info!(
            "WAV encoded: {} samples, {} bytes, {} video frames",
            self.samples.len(),
            bytes.len(),
            self.video_frames
        );

        Ok(EncodedOutput {
            bytes,
            mime_type: "audio/wav".to_string(),
            video_frames: self.video_frames,
        })
    }

    fn mime_type(&self) -> &str {
        "audio/wav"
    }
}

pub struct WavEncoderFactory;

impl EncoderFactory for WavEncoderFactory {
    fn create(&self, config: &RecordingConfig) -> Result<Box<dyn MediaEncoder>, RecordingError> {
        Ok(Box::new(WavEncoder::new(config.sample_rate, config.channels)))
    }

    fn name(&self) -> &str {
        "wav"
    }
}

/// Encoder for `config.format`
///
/// Video containers fall back to WAV when the ffmpeg binary can't be started.
pub fn encoder_factory(config: &RecordingConfig) -> Arc<dyn EncoderFactory> {
    match config.format {
        ContainerFormat::Wav => Arc::new(WavEncoderFactory),
        format if super::ffmpeg::ffmpeg_available(&config.ffmpeg_path) => Arc::new(
            super::ffmpeg::FfmpegEncoderFactory::new(&config.ffmpeg_path, format),
        ),
        format => {
            warn!(
                "{} not available, recording {:?} falls back to WAV audio",
                config.ffmpeg_path, format
            );
            Arc::new(WavEncoderFactory)
        }
    }
}
