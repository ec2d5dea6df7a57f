//! Seam between raw frames and the samples a network adapter carries
//!
//! Local tracks run an encoding pump that turns their frames into
//! `EncodedSample`s; peer bindings feed depacketized remote samples through a
//! decoder and push the frames onto the remote track.

use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use super::track::{AudioFrame, EncodedSample, MediaTrack, TrackKind, VideoFrame};
use crate::config::DevicesConfig;
use crate::error::CodecError;

/// Raw geometry both ends of a codec agree on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
}

impl From<&DevicesConfig> for FrameFormat {
    fn from(config: &DevicesConfig) -> Self {
        Self {
            width: config.video_width,
            height: config.video_height,
            fps: config.video_fps.max(1),
            sample_rate: config.sample_rate,
            channels: config.channels.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum MediaFrame {
    Audio(AudioFrame),
    Video(VideoFrame),
}

impl MediaFrame {
    pub fn kind(&self) -> TrackKind {
        match self {
            MediaFrame::Audio(_) => TrackKind::Audio,
            MediaFrame::Video(_) => TrackKind::Video,
        }
    }
}

/// Raw frames in, wire samples out
///
/// Implementations may buffer; `encode` returns whatever became ready.
pub trait SampleEncoder: Send {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedSample>, CodecError>;
}

/// Depacketized wire samples in, raw frames out
pub trait SampleDecoder: Send {
    fn decode(&mut self, sample: &EncodedSample) -> Result<Vec<MediaFrame>, CodecError>;
}

/// Creates one encoder or decoder per track
pub trait CodecFactory: Send + Sync {
    fn encoder(
        &self,
        kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleEncoder>, CodecError>;

    fn decoder(
        &self,
        kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleDecoder>, CodecError>;

    /// Factory name for logging
    fn name(&self) -> &str;
}

/// Push a decoded frame onto the track it belongs to
pub fn deliver(track: &MediaTrack, frame: MediaFrame) {
    match frame {
        MediaFrame::Audio(audio) => track.push_audio(audio),
        MediaFrame::Video(video) => track.push_video(video),
    }
}

// Codecs may block on pipes, so every call runs on the blocking pool and
// hands the codec back.

pub async fn encode_blocking(
    mut encoder: Box<dyn SampleEncoder>,
    frame: MediaFrame,
) -> Option<(Box<dyn SampleEncoder>, Result<Vec<EncodedSample>, CodecError>)> {
    tokio::task::spawn_blocking(move || {
        let result = encoder.encode(&frame);
        (encoder, result)
    })
    .await
    .ok()
}

pub async fn decode_blocking(
    mut decoder: Box<dyn SampleDecoder>,
    sample: EncodedSample,
) -> Option<(Box<dyn SampleDecoder>, Result<Vec<MediaFrame>, CodecError>)> {
    tokio::task::spawn_blocking(move || {
        let result = decoder.decode(&sample);
        (decoder, result)
    })
    .await
    .ok()
}

/// Encode every frame `track` produces and publish the samples on it
///
/// The pump holds only a weak reference and ends with the track, or at the
/// first codec error.
pub fn spawn_encoding(track: &Arc<MediaTrack>, encoder: Box<dyn SampleEncoder>) {
    let weak = Arc::downgrade(track);
    let kind = track.kind();
    let id = track.id().to_string();

    match kind {
        TrackKind::Video => {
            let mut frames = track.watch_video();
            tokio::spawn(async move {
                let mut encoder = encoder;
                while frames.changed().await.is_ok() {
                    let Some(frame) = frames.borrow_and_update().clone() else {
                        break;
                    };
                    let Some(next) = encode_and_publish(&weak, encoder, MediaFrame::Video(frame)).await
                    else {
                        break;
                    };
                    encoder = next;
                }
                debug!("Video encoding for track {} finished", id);
            });
        }
        TrackKind::Audio => {
            let mut frames = track.subscribe_audio();
            tokio::spawn(async move {
                let mut encoder = encoder;
                loop {
                    let frame = match frames.recv().await {
                        Ok(frame) => frame,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Audio encoder for track {} skipped {} frames", id, skipped);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let Some(next) = encode_and_publish(&weak, encoder, MediaFrame::Audio(frame)).await
                    else {
                        break;
                    };
                    encoder = next;
                }
                debug!("Audio encoding for track {} finished", id);
            });
        }
    }
}

async fn encode_and_publish(
    track: &std::sync::Weak<MediaTrack>,
    encoder: Box<dyn SampleEncoder>,
    frame: MediaFrame,
) -> Option<Box<dyn SampleEncoder>> {
    let (encoder, result) = encode_blocking(encoder, frame).await?;
    let track = track.upgrade()?;
    if track.is_stopped() {
        return None;
    }
    match result {
        Ok(samples) => {
            for sample in samples {
                track.push_encoded(sample);
            }
            Some(encoder)
        }
        Err(e) => {
            warn!("Encoding {} track {} stopped: {}", track.kind(), track.id(), e);
            None
        }
    }
}
