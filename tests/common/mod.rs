// Shared fakes for the integration tests
//
// - FakeBindingFactory / FakeBinding: scripted peer transport that records
//   every call and can report itself connected
// - CapturingEncoderFactory: keeps the last composed frame and all audio
// - FailingEncoderFactory: rejects every write
// - MemorySink: keeps stored artifacts in memory
// - RawCodecs: passthrough codec that ships raw frames as samples

#![allow(dead_code)]

use async_trait::async_trait;
use interview_rtc::config::{Config, DevicesConfig, RecordingConfig, SignalingConfig};
use bytes::{BufMut, BytesMut};
use interview_rtc::error::{CodecError, NegotiationError, RecordingError};
use interview_rtc::media::{
    AudioFrame, CodecFactory, EncodedSample, FrameFormat, MediaFrame, MediaTrack, SampleDecoder,
    SampleEncoder, StreamOrigin, TrackKind, VideoFrame,
};
use interview_rtc::negotiation::{
    BindingEvent, LinkState, PeerBindingFactory, PeerTransportBinding, SessionDescription,
};
use interview_rtc::recording::{
    Artifact, ArtifactSink, EncodedOutput, EncoderFactory, MediaEncoder,
};
use interview_rtc::signaling::IceCandidate;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub fn signaling_config() -> SignalingConfig {
    SignalingConfig {
        connect_timeout_ms: 1_000,
        ack_timeout_ms: 1_000,
        ..SignalingConfig::default()
    }
}

pub fn devices_config() -> DevicesConfig {
    DevicesConfig {
        video_width: 32,
        video_height: 24,
        ..DevicesConfig::default()
    }
}

pub fn recording_config() -> RecordingConfig {
    RecordingConfig {
        width: 64,
        height: 36,
        inset_width: 16,
        inset_height: 9,
        inset_margin: 2,
        ..RecordingConfig::default()
    }
}

pub fn test_config() -> Config {
    Config {
        signaling: signaling_config(),
        devices: devices_config(),
        recording: recording_config(),
        ..Config::default()
    }
}

/// Poll `condition` until it holds or `limit` passes
pub async fn wait_until<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ============================================================================
// Peer binding
// ============================================================================

#[derive(Debug, Default)]
pub struct BindingLog {
    pub local: Option<SessionDescription>,
    pub remote: Option<SessionDescription>,
    /// Remote candidates in the order they were applied
    pub candidates: Vec<IceCandidate>,
    pub added_tracks: Vec<String>,
    /// Current track id per outbound sender
    pub senders: HashMap<TrackKind, Option<String>>,
    pub replacements: usize,
    pub offers_created: usize,
    pub closed: bool,
}

pub struct FakeBinding {
    name: String,
    auto_connect: bool,
    /// Shared by every binding of one factory, so offers never repeat
    offer_seq: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<BindingEvent>,
    pub log: Mutex<BindingLog>,
    pub fail_replace: Mutex<bool>,
    pub reject_candidates: Mutex<bool>,
}

impl FakeBinding {
    /// Push a notification as the platform transport would
    pub fn emit(&self, event: BindingEvent) {
        let _ = self.tx.send(event);
    }

    fn maybe_connect(&self, log: &BindingLog) {
        if self.auto_connect && log.local.is_some() && log.remote.is_some() {
            self.emit(BindingEvent::RemoteTrack(Arc::new(MediaTrack::remote(
                TrackKind::Audio,
                format!("{}-remote-audio", self.name),
            ))));
            self.emit(BindingEvent::StateChanged(LinkState::Connected));
        }
    }
}

#[async_trait]
impl PeerTransportBinding for FakeBinding {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.log.lock().offers_created += 1;
        let seq = self.offer_seq.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(SessionDescription::offer(format!("v=0 offer {} #{}", self.name, seq)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.name)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut log = self.log.lock();
        log.local = Some(description);
        self.emit(BindingEvent::CandidateDiscovered(
            IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.1 9 typ host", self.name))
                .with_mid("0", 0),
        ));
        self.maybe_connect(&log);
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        let mut log = self.log.lock();
        log.remote = Some(description);
        self.maybe_connect(&log);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        if *self.reject_candidates.lock() {
            return Err(NegotiationError::Binding("candidate rejected".to_string()));
        }
        self.log.lock().candidates.push(candidate);
        Ok(())
    }

    async fn add_track(&self, track: Arc<MediaTrack>) -> Result<(), NegotiationError> {
        let mut log = self.log.lock();
        log.added_tracks.push(track.id().to_string());
        log.senders.insert(track.kind(), Some(track.id().to_string()));
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), NegotiationError> {
        if *self.fail_replace.lock() {
            return Err(NegotiationError::Binding("sender gone".to_string()));
        }
        let mut log = self.log.lock();
        log.replacements += 1;
        log.senders.insert(kind, track.map(|t| t.id().to_string()));
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().closed = true;
    }
}

pub struct FakeBindingFactory {
    name: String,
    auto_connect: bool,
    offer_seq: Arc<AtomicUsize>,
    pub bindings: Mutex<Vec<Arc<FakeBinding>>>,
}

impl FakeBindingFactory {
    fn build(name: &str, auto_connect: bool) -> Self {
        Self {
            name: name.to_string(),
            auto_connect,
            offer_seq: Arc::new(AtomicUsize::new(0)),
            bindings: Mutex::new(Vec::new()),
        }
    }

    /// Bindings that only change state when the test says so
    pub fn manual() -> Self {
        Self::build("fake", false)
    }

    /// Manual bindings whose descriptions carry `name`
    pub fn manual_named(name: &str) -> Self {
        Self::build(name, false)
    }

    /// Bindings that report Connected once both descriptions are applied
    pub fn auto(name: &str) -> Self {
        Self::build(name, true)
    }

    pub fn last(&self) -> Option<Arc<FakeBinding>> {
        self.bindings.lock().last().cloned()
    }

    pub fn created(&self) -> usize {
        self.bindings.lock().len()
    }
}

#[async_trait]
impl PeerBindingFactory for FakeBindingFactory {
    async fn create(
        &self,
    ) -> Result<
        (
            Arc<dyn PeerTransportBinding>,
            mpsc::UnboundedReceiver<BindingEvent>,
        ),
        NegotiationError,
    > {
        let (tx, rx) = mpsc::unbounded_channel();
        let binding = Arc::new(FakeBinding {
            name: self.name.clone(),
            auto_connect: self.auto_connect,
            offer_seq: self.offer_seq.clone(),
            tx,
            log: Mutex::new(BindingLog::default()),
            fail_replace: Mutex::new(false),
            reject_candidates: Mutex::new(false),
        });
        self.bindings.lock().push(binding.clone());
        Ok((binding, rx))
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Recording
// ============================================================================

#[derive(Default)]
pub struct Capture {
    pub last_frame: Option<VideoFrame>,
    pub frames: u64,
    pub audio: Vec<i16>,
}

pub struct CapturingEncoderFactory {
    pub capture: Arc<Mutex<Capture>>,
}

impl CapturingEncoderFactory {
    pub fn new() -> Self {
        Self {
            capture: Arc::new(Mutex::new(Capture::default())),
        }
    }
}

struct CapturingEncoder {
    capture: Arc<Mutex<Capture>>,
}

impl MediaEncoder for CapturingEncoder {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<(), RecordingError> {
        let mut capture = self.capture.lock();
        capture.frames += 1;
        capture.last_frame = Some(frame.clone());
        Ok(())
    }

    fn write_audio(&mut self, frame: &AudioFrame) -> Result<(), RecordingError> {
        self.capture.lock().audio.extend_from_slice(&frame.samples);
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<EncodedOutput, RecordingError> {
        let capture = self.capture.lock();
        Ok(EncodedOutput {
            bytes: vec![0; 16],
            mime_type: "video/webm".to_string(),
            video_frames: capture.frames,
        })
    }

    fn mime_type(&self) -> &str {
        "video/webm"
    }
}

impl EncoderFactory for CapturingEncoderFactory {
    fn create(&self, _config: &RecordingConfig) -> Result<Box<dyn MediaEncoder>, RecordingError> {
        *self.capture.lock() = Capture::default();
        Ok(Box::new(CapturingEncoder {
            capture: self.capture.clone(),
        }))
    }

    fn name(&self) -> &str {
        "capturing"
    }
}

pub struct FailingEncoderFactory;

struct FailingEncoder;

impl MediaEncoder for FailingEncoder {
    fn write_video(&mut self, _frame: &VideoFrame) -> Result<(), RecordingError> {
        Err(RecordingError::Encoder("disk full".to_string()))
    }

    fn write_audio(&mut self, _frame: &AudioFrame) -> Result<(), RecordingError> {
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<EncodedOutput, RecordingError> {
        Ok(EncodedOutput {
            bytes: Vec::new(),
            mime_type: "video/webm".to_string(),
            video_frames: 0,
        })
    }

    fn mime_type(&self) -> &str {
        "video/webm"
    }
}

impl EncoderFactory for FailingEncoderFactory {
    fn create(&self, _config: &RecordingConfig) -> Result<Box<dyn MediaEncoder>, RecordingError> {
        Ok(Box::new(FailingEncoder))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[derive(Default)]
pub struct MemorySink {
    pub stored: Mutex<Vec<Artifact>>,
}

#[async_trait]
impl ArtifactSink for MemorySink {
    async fn store(&self, artifact: &Artifact) -> Result<String, RecordingError> {
        self.stored.lock().push(artifact.clone());
        Ok(format!("memory://{}", artifact.recording_id))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

// ============================================================================
// Codec
// ============================================================================

/// Video samples are `width:u16 height:u16 rgba...`, audio samples are
/// little-endian i16. Keep frames small enough for a single RTP packet.
pub struct RawCodecs;

struct RawEncoder {
    format: FrameFormat,
}

struct RawDecoder {
    kind: TrackKind,
    format: FrameFormat,
}

impl SampleEncoder for RawEncoder {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedSample>, CodecError> {
        let sample = match frame {
            MediaFrame::Video(video) => {
                let mut data = BytesMut::with_capacity(4 + video.data.len());
                data.put_u16(video.width as u16);
                data.put_u16(video.height as u16);
                data.put_slice(&video.data);
                EncodedSample {
                    data: data.freeze(),
                    duration: Duration::from_secs(1) / self.format.fps,
                }
            }
            MediaFrame::Audio(audio) => {
                let mut data = BytesMut::with_capacity(audio.samples.len() * 2);
                for sample in &audio.samples {
                    data.put_i16_le(*sample);
                }
                let per_second = audio.sample_rate as u64 * audio.channels.max(1) as u64;
                EncodedSample {
                    data: data.freeze(),
                    duration: Duration::from_micros(
                        audio.samples.len() as u64 * 1_000_000 / per_second.max(1),
                    ),
                }
            }
        };
        Ok(vec![sample])
    }
}

impl SampleDecoder for RawDecoder {
    fn decode(&mut self, sample: &EncodedSample) -> Result<Vec<MediaFrame>, CodecError> {
        let data = &sample.data;
        let malformed = || CodecError::Stream {
            codec: "raw",
            reason: format!("{} byte {} sample", data.len(), self.kind),
        };
        match self.kind {
            TrackKind::Video => {
                if data.len() < 4 {
                    return Err(malformed());
                }
                let width = u16::from_be_bytes([data[0], data[1]]) as u32;
                let height = u16::from_be_bytes([data[2], data[3]]) as u32;
                if data.len() != 4 + (width * height * 4) as usize {
                    return Err(malformed());
                }
                Ok(vec![MediaFrame::Video(VideoFrame {
                    width,
                    height,
                    data: data.slice(4..),
                    timestamp_ms: 0,
                })])
            }
            TrackKind::Audio => {
                if data.len() % 2 != 0 {
                    return Err(malformed());
                }
                let samples = data
                    .chunks_exact(2)
                    .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
                    .collect();
                Ok(vec![MediaFrame::Audio(AudioFrame {
                    samples,
                    sample_rate: self.format.sample_rate,
                    channels: self.format.channels,
                    timestamp_ms: 0,
                    origin: StreamOrigin::Remote,
                })])
            }
        }
    }
}

impl CodecFactory for RawCodecs {
    fn encoder(
        &self,
        _kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleEncoder>, CodecError> {
        Ok(Box::new(RawEncoder { format: *format }))
    }

    fn decoder(
        &self,
        kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleDecoder>, CodecError> {
        Ok(Box::new(RawDecoder {
            kind,
            format: *format,
        }))
    }

    fn name(&self) -> &str {
        "raw"
    }
}
