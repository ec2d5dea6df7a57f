use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable prefix, e.g. `INTERVIEW_RTC__SIGNALING__NATS_URL`
const ENV_PREFIX: &str = "INTERVIEW_RTC";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service: ServiceConfig,
    pub signaling: SignalingConfig,
    pub webrtc: WebRtcConfig,
    pub devices: DevicesConfig,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "interview-rtc".to_string(),
            http: HttpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
    /// Browser origins allowed to call the control API
    pub cors_origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 7420,
            cors_origins: Vec::new(),
        }
    }
}

/// Signaling transport settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// NATS server URL of the relay
    pub nats_url: String,
    /// First subject token, subjects look like `<prefix>.room.<id>.signal`
    pub subject_prefix: String,
    /// Per-attempt connect timeout
    pub connect_timeout_ms: u64,
    /// How long an acknowledged send waits for its response
    pub ack_timeout_ms: u64,
    /// First reconnect delay; doubles on every failed attempt
    pub initial_backoff_ms: u64,
    /// Upper bound for the reconnect delay
    pub max_backoff_ms: u64,
    /// Consecutive failed reconnects before giving up (0 = never give up)
    pub max_reconnect_attempts: u32,
}

impl SignalingConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            nats_url: "nats://localhost:4222".to_string(),
            subject_prefix: "interview".to_string(),
            connect_timeout_ms: 10_000,
            ack_timeout_ms: 5_000,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 30_000,
            max_reconnect_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
    /// Offer 127.0.0.1 host candidates (same-machine calls)
    pub include_loopback: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

/// Local capture settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DevicesConfig {
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub sample_rate: u32,
    pub channels: u16,
    /// Acquire a microphone when the call starts
    pub start_audio: bool,
    /// Acquire a camera when the call starts
    pub start_video: bool,
    /// Encode local tracks to VP8/Opus and decode remote ones through ffmpeg
    pub transcode: bool,
    /// ffmpeg binary used for transcoding
    pub ffmpeg_path: String,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            video_width: 640,
            video_height: 480,
            video_fps: 30,
            sample_rate: 48_000,
            channels: 1,
            start_audio: true,
            start_video: true,
            transcode: true,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

/// Recording pipeline settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Compositor frame rate
    pub fps: u32,
    /// Output frame size
    pub width: u32,
    pub height: u32,
    /// Local picture-in-picture size, drawn in the bottom-right corner
    pub inset_width: u32,
    pub inset_height: u32,
    /// Gap between the inset and the frame edges
    pub inset_margin: u32,
    /// Mixed audio format
    pub sample_rate: u32,
    pub channels: u16,
    /// Where `FileArtifactSink` writes finished recordings
    pub output_dir: String,
    /// Artifact container; `webm` and `mp4` need an ffmpeg binary
    pub format: ContainerFormat,
    /// ffmpeg binary used by the video encoder
    pub ffmpeg_path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    /// VP8 video and Opus audio
    Webm,
    /// H.264 video and AAC audio
    Mp4,
    /// Mixed audio only
    Wav,
}

impl RecordingConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_micros((1_000_000 / self.fps.max(1) as u64).max(1))
    }
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            width: 1280,
            height: 720,
            inset_width: 320,
            inset_height: 180,
            inset_margin: 16,
            sample_rate: 48_000,
            channels: 1,
            output_dir: "recordings".to_string(),
            format: ContainerFormat::Webm,
            ffmpeg_path: "ffmpeg".to_string(),
        }
    }
}

impl Config {
    /// Load `path` (any format the config crate understands, extension optional)
    /// layered under `INTERVIEW_RTC__*` environment variables
    ///
    /// A missing file is not an error; every field has a default.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}
