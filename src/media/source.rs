use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::f32::consts::TAU;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::codec::{self, CodecFactory, FrameFormat};
use super::track::{AudioFrame, MediaTrack, StreamOrigin, TrackKind, VideoFrame};
use crate::config::DevicesConfig;
use crate::error::DeviceError;

/// Length of one synthetic audio frame
const AUDIO_FRAME_MS: u64 = 20;

/// A capture device as reported by a `MediaSource`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub label: String,
    pub kind: TrackKind,
    pub is_default: bool,
}

/// Local capture capability
///
/// Platform-specific implementations wrap camera/microphone APIs. Every
/// call to `acquire` hands out a fresh track; the caller owns its lifecycle.
#[async_trait]
pub trait MediaSource: Send + Sync {
    /// Open a new track on `device_id`, or on the default device when None
    async fn acquire(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<Arc<MediaTrack>, DeviceError>;

    /// Devices of `kind` currently known to the source
    fn devices(&self, kind: TrackKind) -> Vec<DeviceInfo>;

    /// Source name for logging
    fn name(&self) -> &str;
}

struct SyntheticDevice {
    id: &'static str,
    label: &'static str,
    kind: TrackKind,
    /// Fill color for cameras
    color: [u8; 4],
    /// Tone frequency for microphones
    tone_hz: f32,
}

const SYNTHETIC_DEVICES: &[SyntheticDevice] = &[
    SyntheticDevice {
        id: "synthetic-camera-0",
        label: "Test pattern (blue)",
        kind: TrackKind::Video,
        color: [32, 64, 192, 255],
        tone_hz: 0.0,
    },
    SyntheticDevice {
        id: "synthetic-camera-1",
        label: "Test pattern (green)",
        kind: TrackKind::Video,
        color: [32, 160, 64, 255],
        tone_hz: 0.0,
    },
    SyntheticDevice {
        id: "synthetic-mic-0",
        label: "Sine 440 Hz",
        kind: TrackKind::Audio,
        color: [0, 0, 0, 0],
        tone_hz: 440.0,
    },
    SyntheticDevice {
        id: "synthetic-mic-1",
        label: "Sine 660 Hz",
        kind: TrackKind::Audio,
        color: [0, 0, 0, 0],
        tone_hz: 660.0,
    },
];

/// Test-pattern camera and sine-tone microphone
///
/// Used for headless runs and integration tests. Devices can be marked
/// unavailable to simulate an unplugged camera.
pub struct SyntheticSource {
    config: DevicesConfig,
    unavailable: Mutex<HashSet<String>>,
    codecs: Option<Arc<dyn CodecFactory>>,
}

impl SyntheticSource {
    pub fn new(config: DevicesConfig) -> Self {
        info!(
            "Synthetic media source initialized ({}x{} @ {}fps, {}Hz {}ch)",
            config.video_width,
            config.video_height,
            config.video_fps,
            config.sample_rate,
            config.channels
        );

        Self {
            config,
            unavailable: Mutex::new(HashSet::new()),
            codecs: None,
        }
    }

    /// Also publish encoded samples for every acquired track
    pub fn with_codecs(mut self, codecs: Arc<dyn CodecFactory>) -> Self {
        info!("Synthetic tracks encoded with {}", codecs.name());
        self.codecs = Some(codecs);
        self
    }

    /// Simulate plugging a device in or out
    pub fn set_available(&self, device_id: &str, available: bool) {
        let mut unavailable = self.unavailable.lock();
        if available {
            unavailable.remove(device_id);
        } else {
            unavailable.insert(device_id.to_string());
        }
    }

    fn find(&self, kind: TrackKind, device_id: Option<&str>) -> Option<&'static SyntheticDevice> {
        SYNTHETIC_DEVICES
            .iter()
            .filter(|d| d.kind == kind)
            .find(|d| device_id.map_or(true, |id| d.id == id))
    }

    fn spawn_camera(&self, track: &Arc<MediaTrack>, device: &SyntheticDevice) {
        let fps = self.config.video_fps.max(1);
        let frame = VideoFrame::solid(
            self.config.video_width,
            self.config.video_height,
            device.color,
            0,
        );
        let pixels: Bytes = frame.data;
        let (width, height) = (frame.width, frame.height);
        let weak = Arc::downgrade(track);

        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = interval(Duration::from_micros((1_000_000 / fps as u64).max(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(track) = weak.upgrade() else { break };
                if track.is_stopped() {
                    break;
                }
                track.push_video(VideoFrame {
                    width,
                    height,
                    data: pixels.clone(),
                    timestamp_ms: started.elapsed().as_millis() as u64,
                });
            }

            debug!("Synthetic camera generator finished");
        });
    }

    fn spawn_microphone(&self, track: &Arc<MediaTrack>, device: &SyntheticDevice) {
        let sample_rate = self.config.sample_rate;
        let channels = self.config.channels.max(1);
        let tone_hz = device.tone_hz;
        let weak = Arc::downgrade(track);

        tokio::spawn(async move {
            let frames_per_tick = (sample_rate as u64 * AUDIO_FRAME_MS / 1000) as usize;
            let step = TAU * tone_hz / sample_rate as f32;
            let mut phase = 0.0f32;
            let mut timestamp_ms = 0u64;
            let mut ticker = interval(Duration::from_millis(AUDIO_FRAME_MS));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let Some(track) = weak.upgrade() else { break };
                if track.is_stopped() {
                    break;
                }

                let mut samples = Vec::with_capacity(frames_per_tick * channels as usize);
                for _ in 0..frames_per_tick {
                    let value = (phase.sin() * i16::MAX as f32 * 0.25) as i16;
                    phase = (phase + step) % TAU;
                    for _ in 0..channels {
                        samples.push(value);
                    }
                }

                track.push_audio(AudioFrame {
                    samples,
                    sample_rate,
                    channels,
                    timestamp_ms,
                    origin: StreamOrigin::Local,
                });
                timestamp_ms += AUDIO_FRAME_MS;
            }

            debug!("Synthetic microphone generator finished");
        });
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn acquire(
        &self,
        kind: TrackKind,
        device_id: Option<&str>,
    ) -> Result<Arc<MediaTrack>, DeviceError> {
        let device = self.find(kind, device_id).ok_or_else(|| DeviceError::NotFound {
            kind,
            device_id: device_id.unwrap_or("default").to_string(),
        })?;

        if self.unavailable.lock().contains(device.id) {
            return Err(DeviceError::Acquisition {
                kind,
                reason: format!("{} is not available", device.id),
            });
        }

        let track = Arc::new(MediaTrack::local(
            kind,
            Some(device.id.to_string()),
            device.label,
        ));

        match kind {
            TrackKind::Video => self.spawn_camera(&track, device),
            TrackKind::Audio => self.spawn_microphone(&track, device),
        }

        if let Some(codecs) = &self.codecs {
            match codecs.encoder(kind, &FrameFormat::from(&self.config)) {
                Ok(encoder) => codec::spawn_encoding(&track, encoder),
                // Raw frames still reach previews and the recorder
                Err(e) => warn!("No encoder for {} track {}: {}", kind, track.id(), e),
            }
        }

        info!("Acquired {} track {} from {}", kind, track.id(), device.id);

        Ok(track)
    }

    fn devices(&self, kind: TrackKind) -> Vec<DeviceInfo> {
        let unavailable = self.unavailable.lock();
        let mut first = true;

        SYNTHETIC_DEVICES
            .iter()
            .filter(|d| d.kind == kind && !unavailable.contains(d.id))
            .map(|d| {
                let info = DeviceInfo {
                    id: d.id.to_string(),
                    label: d.label.to_string(),
                    kind,
                    is_default: first,
                };
                first = false;
                info
            })
            .collect()
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}
