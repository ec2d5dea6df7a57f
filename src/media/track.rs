use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::debug;

const AUDIO_CHANNEL_CAPACITY: usize = 64;
const ENCODED_CHANNEL_CAPACITY: usize = 64;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Which side of the call a stream belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamOrigin {
    /// Captured on this machine
    Local,
    /// Received from the other participant
    Remote,
}

/// Raw video frame (RGBA, row-major, 4 bytes per pixel)
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    /// Capture timestamp in milliseconds
    pub timestamp_ms: u64,
}

impl VideoFrame {
    /// Frame filled with a single color
    pub fn solid(width: u32, height: u32, rgba: [u8; 4], timestamp_ms: u64) -> Self {
        let pixels = (width * height) as usize;
        let mut data = Vec::with_capacity(pixels * 4);
        for _ in 0..pixels {
            data.extend_from_slice(&rgba);
        }

        Self {
            width,
            height,
            data: Bytes::from(data),
            timestamp_ms,
        }
    }

    /// RGBA value at (x, y), or None when out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y * self.width + x) * 4) as usize;
        let px = self.data.get(offset..offset + 4)?;
        Some([px[0], px[1], px[2], px[3]])
    }
}

/// Audio sample data (16-bit PCM, interleaved)
#[derive(Debug, Clone)]
pub struct AudioFrame {
    /// Raw audio samples (i16 PCM, interleaved)
    pub samples: Vec<i16>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Number of channels
    pub channels: u16,
    /// Timestamp in milliseconds since capture started
    pub timestamp_ms: u64,
    /// Side of the call the samples came from
    pub origin: StreamOrigin,
}

impl AudioFrame {
    /// A frame of zeroed samples covering `duration_ms`
    pub fn silence(
        sample_rate: u32,
        channels: u16,
        duration_ms: u64,
        timestamp_ms: u64,
        origin: StreamOrigin,
    ) -> Self {
        let len = (sample_rate as u64 * duration_ms / 1000) as usize * channels as usize;
        Self {
            samples: vec![0; len],
            sample_rate,
            channels,
            timestamp_ms,
            origin,
        }
    }

    pub fn duration_ms(&self) -> u64 {
        if self.sample_rate == 0 || self.channels == 0 {
            return 0;
        }
        self.samples.len() as u64 * 1000 / (self.sample_rate as u64 * self.channels as u64)
    }
}

/// Codec payload travelling between a track and a network adapter
#[derive(Debug, Clone)]
pub struct EncodedSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// A single audio or video track
///
/// The owning side pushes frames in; readers (peer bindings, the recording
/// pipeline, previews) pull them out. A disabled track keeps its allocation
/// but yields no video and drops audio, which reads as black/silence.
pub struct MediaTrack {
    id: String,
    kind: TrackKind,
    origin: StreamOrigin,
    device_id: Option<String>,
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
    video_tx: watch::Sender<Option<VideoFrame>>,
    audio_tx: broadcast::Sender<AudioFrame>,
    encoded_tx: broadcast::Sender<EncodedSample>,
}

impl MediaTrack {
    fn new(
        id: String,
        kind: TrackKind,
        origin: StreamOrigin,
        device_id: Option<String>,
        label: String,
    ) -> Self {
        let (video_tx, _) = watch::channel(None);
        let (audio_tx, _) = broadcast::channel(AUDIO_CHANNEL_CAPACITY);
        let (encoded_tx, _) = broadcast::channel(ENCODED_CHANNEL_CAPACITY);

        Self {
            id,
            kind,
            origin,
            device_id,
            label,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            video_tx,
            audio_tx,
            encoded_tx,
        }
    }

    /// Track captured from a local device
    pub fn local(kind: TrackKind, device_id: Option<String>, label: impl Into<String>) -> Self {
        Self::new(
            uuid::Uuid::new_v4().to_string(),
            kind,
            StreamOrigin::Local,
            device_id,
            label.into(),
        )
    }

    /// Track announced by the remote peer
    pub fn remote(kind: TrackKind, id: impl Into<String>) -> Self {
        let id = id.into();
        let label = format!("remote-{}", kind);
        Self::new(id, kind, StreamOrigin::Remote, None, label)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Flip the enabled flag. Returns true if the value changed.
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let previous = self.enabled.swap(enabled, Ordering::SeqCst);
        if previous != enabled {
            debug!("Track {} ({}) enabled={}", self.id, self.kind, enabled);
        }
        previous != enabled
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Whether the track still produces media (not stopped and enabled)
    pub fn is_live(&self) -> bool {
        !self.is_stopped() && self.is_enabled()
    }

    /// Release the track. Returns false if it was already stopped.
    pub fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.video_tx.send_replace(None);
        debug!("Track {} ({}) stopped", self.id, self.kind);
        true
    }

    pub fn push_video(&self, frame: VideoFrame) {
        if self.is_stopped() {
            return;
        }
        self.video_tx.send_replace(Some(frame));
    }

    /// Most recent video frame, None while disabled, stopped or before the first frame
    pub fn latest_video(&self) -> Option<VideoFrame> {
        if !self.is_live() {
            return None;
        }
        self.video_tx.borrow().clone()
    }

    pub fn watch_video(&self) -> watch::Receiver<Option<VideoFrame>> {
        self.video_tx.subscribe()
    }

    pub fn push_audio(&self, frame: AudioFrame) {
        if !self.is_live() {
            return;
        }
        // No receivers is normal
        let _ = self.audio_tx.send(frame);
    }

    pub fn subscribe_audio(&self) -> broadcast::Receiver<AudioFrame> {
        self.audio_tx.subscribe()
    }

    pub fn push_encoded(&self, sample: EncodedSample) {
        if !self.is_live() {
            return;
        }
        let _ = self.encoded_tx.send(sample);
    }

    pub fn subscribe_encoded(&self) -> broadcast::Receiver<EncodedSample> {
        self.encoded_tx.subscribe()
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("origin", &self.origin)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
