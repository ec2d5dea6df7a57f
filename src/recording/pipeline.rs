use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::compositor::{Compositor, Layout, SoftwareCompositor};
use super::encoder::{EncoderFactory, MediaEncoder};
use super::mixer::{AudioMixer, MixerConfig};
use super::sink::Artifact;
use super::state::{DurationClock, RecordingState};
use crate::config::RecordingConfig;
use crate::error::RecordingError;
use crate::events::{Event, EventDispatcher, Subscription};
use crate::media::{AudioFrame, MediaStream, StreamOrigin};

/// Returned by `start`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingInfo {
    pub recording_id: String,
    pub started_at: DateTime<Utc>,
    pub mime_type: String,
    pub has_local: bool,
    pub has_remote: bool,
}

#[derive(Debug, Clone)]
pub enum RecordingEvent {
    StateChanged(RecordingState),
    /// Encoder failure inside the compositing loop; the recording keeps going
    Error(RecordingError),
}

impl Event for RecordingEvent {
    fn name(&self) -> &'static str {
        match self {
            RecordingEvent::StateChanged(_) => "state-changed",
            RecordingEvent::Error(_) => "error",
        }
    }
}

type SharedEncoder = Arc<Mutex<Option<Box<dyn MediaEncoder>>>>;

/// State the compositing loop reads while it runs
struct Shared {
    state: RwLock<RecordingState>,
    clock: Mutex<DurationClock>,
    encoder: SharedEncoder,
    events: EventDispatcher<RecordingEvent>,
}

impl Shared {
    fn state(&self) -> RecordingState {
        *self.state.read()
    }

    fn set_state(&self, state: RecordingState) {
        *self.state.write() = state;
        info!("Recording state: {:?}", state);
        self.events.emit(RecordingEvent::StateChanged(state));
    }
}

struct ActiveRecording {
    info: RecordingInfo,
    local: Option<Arc<MediaStream>>,
    remote: Option<Arc<MediaStream>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

/// Composites both sides of a call into a single recording
///
/// Video runs through a `Compositor` at the configured frame rate, audio from
/// both sides is mixed into one track, and both go to a `MediaEncoder`. Source
/// tracks are only read, never stopped.
pub struct RecordingPipeline {
    config: RecordingConfig,
    factory: Arc<dyn EncoderFactory>,
    shared: Arc<Shared>,
    /// Serializes control calls; holds the running recording
    active: AsyncMutex<Option<ActiveRecording>>,
}

impl RecordingPipeline {
    pub fn new(config: RecordingConfig, factory: Arc<dyn EncoderFactory>) -> Self {
        Self {
            config,
            factory,
            shared: Arc::new(Shared {
                state: RwLock::new(RecordingState::Inactive),
                clock: Mutex::new(DurationClock::default()),
                encoder: Arc::new(Mutex::new(None)),
                events: EventDispatcher::new("recording"),
            }),
            active: AsyncMutex::new(None),
        }
    }

    pub fn state(&self) -> RecordingState {
        self.shared.state()
    }

    /// Recorded time so far (paused intervals excluded)
    pub fn duration(&self) -> Duration {
        self.shared.clock.lock().elapsed()
    }

    pub async fn info(&self) -> Option<RecordingInfo> {
        self.active.lock().await.as_ref().map(|a| a.info.clone())
    }

    pub async fn start(
        &self,
        local: Option<Arc<MediaStream>>,
        remote: Option<Arc<MediaStream>>,
    ) -> Result<RecordingInfo, RecordingError> {
        let mut active = self.active.lock().await;

        let state = self.state();
        if state != RecordingState::Inactive {
            return Err(RecordingError::InvalidState {
                operation: "start",
                state,
            });
        }

        let encoder = self.factory.create(&self.config)?;
        let info = RecordingInfo {
            recording_id: uuid::Uuid::new_v4().to_string(),
            started_at: Utc::now(),
            mime_type: encoder.mime_type().to_string(),
            has_local: local.is_some(),
            has_remote: remote.is_some(),
        };
        *self.shared.encoder.lock() = Some(encoder);

        info!(
            "Starting recording {} ({} encoder, local={}, remote={})",
            info.recording_id,
            self.factory.name(),
            info.has_local,
            info.has_remote
        );

        self.shared.clock.lock().start(Instant::now());
        self.shared.set_state(RecordingState::Recording);

        let cancel = CancellationToken::new();
        let task = self.spawn_loop(local.clone(), remote.clone(), cancel.clone());

        *active = Some(ActiveRecording {
            info: info.clone(),
            local,
            remote,
            cancel,
            task: Some(task),
        });

        Ok(info)
    }

    pub async fn pause(&self) -> Result<(), RecordingError> {
        let mut active = self.active.lock().await;

        let state = self.state();
        let Some(recording) = active.as_mut().filter(|_| state == RecordingState::Recording)
        else {
            return Err(RecordingError::InvalidState {
                operation: "pause",
                state,
            });
        };

        self.shared.clock.lock().pause(Instant::now());
        self.shared.set_state(RecordingState::Paused);
        halt_loop(recording).await;

        Ok(())
    }

    pub async fn resume(&self) -> Result<(), RecordingError> {
        let mut active = self.active.lock().await;

        let state = self.state();
        let Some(recording) = active.as_mut().filter(|_| state == RecordingState::Paused) else {
            return Err(RecordingError::InvalidState {
                operation: "resume",
                state,
            });
        };

        self.shared.clock.lock().resume(Instant::now());
        self.shared.set_state(RecordingState::Recording);

        recording.cancel = CancellationToken::new();
        recording.task = Some(self.spawn_loop(
            recording.local.clone(),
            recording.remote.clone(),
            recording.cancel.clone(),
        ));

        Ok(())
    }

    /// Finish the recording and return the artifact
    ///
    /// The loop is awaited before the encoder is finalized, so no frame is
    /// written after this returns.
    pub async fn stop(&self) -> Result<Artifact, RecordingError> {
        let mut active = self.active.lock().await;

        let state = self.state();
        let Some(mut recording) = active.take().filter(|_| state != RecordingState::Inactive)
        else {
            return Err(RecordingError::InvalidState {
                operation: "stop",
                state,
            });
        };

        let duration = self.shared.clock.lock().stop(Instant::now());
        halt_loop(&mut recording).await;

        let encoder = self.shared.encoder.lock().take();
        self.shared.set_state(RecordingState::Inactive);

        let encoder =
            encoder.ok_or_else(|| RecordingError::Encoder("encoder missing".to_string()))?;
        // Finishing may wait on an external muxer
        let output = tokio::task::spawn_blocking(move || encoder.finish())
            .await
            .map_err(|e| RecordingError::Encoder(format!("encoder task failed: {}", e)))??;

        let artifact = Artifact {
            recording_id: recording.info.recording_id,
            interview_id: None,
            size_bytes: output.bytes.len() as u64,
            bytes: output.bytes,
            duration_seconds: duration.as_millis() as f64 / 1000.0,
            duration_ms: duration.as_millis() as u64,
            mime_type: output.mime_type,
            video_frames: output.video_frames,
            started_at: recording.info.started_at,
        };

        info!(
            "Recording {} stopped: {:.3}s, {} bytes, {} frames",
            artifact.recording_id,
            artifact.duration_seconds,
            artifact.size_bytes,
            artifact.video_frames
        );

        Ok(artifact)
    }

    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&RecordingEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.shared.events.unsubscribe(subscription)
    }

    pub fn events(&self) -> &EventDispatcher<RecordingEvent> {
        &self.shared.events
    }

    fn spawn_loop(
        &self,
        local: Option<Arc<MediaStream>>,
        remote: Option<Arc<MediaStream>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let shared = self.shared.clone();
        let config = self.config.clone();

        tokio::spawn(async move {
            compositing_loop(shared, config, local, remote, cancel).await;
        })
    }
}

impl Drop for RecordingPipeline {
    fn drop(&mut self) {
        if let Some(recording) = self.active.get_mut().as_mut() {
            recording.cancel.cancel();
            if let Some(task) = recording.task.take() {
                task.abort();
            }
        }
    }
}

async fn halt_loop(recording: &mut ActiveRecording) {
    recording.cancel.cancel();
    if let Some(task) = recording.task.take() {
        if let Err(e) = task.await {
            error!("Compositing loop ended abnormally: {}", e);
        }
    }
}

/// Audio subscription that follows whatever track the stream currently holds
struct AudioTap {
    origin: StreamOrigin,
    stream: Arc<MediaStream>,
    track_id: Option<String>,
    rx: Option<broadcast::Receiver<AudioFrame>>,
}

impl AudioTap {
    fn new(origin: StreamOrigin, stream: Arc<MediaStream>) -> Self {
        let mut tap = Self {
            origin,
            stream,
            track_id: None,
            rx: None,
        };
        tap.refresh();
        tap
    }

    fn refresh(&mut self) {
        let track = self.stream.audio_track();
        let id = track.as_ref().map(|t| t.id().to_string());
        if id != self.track_id {
            debug!("{:?} audio tap now follows {:?}", self.origin, id);
            self.rx = track.map(|t| t.subscribe_audio());
            self.track_id = id;
        }
    }

    fn drain_into(&mut self, mixer: &mut AudioMixer) {
        self.refresh();
        let Some(rx) = self.rx.as_mut() else {
            return;
        };

        loop {
            match rx.try_recv() {
                Ok(mut frame) => {
                    frame.origin = self.origin;
                    mixer.push(frame);
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("{:?} audio tap lagged, {} frames lost", self.origin, skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}

async fn compositing_loop(
    shared: Arc<Shared>,
    config: RecordingConfig,
    local: Option<Arc<MediaStream>>,
    remote: Option<Arc<MediaStream>>,
    cancel: CancellationToken,
) {
    let fps = config.fps.max(1) as u64;
    let sample_rate = config.sample_rate as u64;

    let mut compositor: Box<dyn Compositor> =
        Box::new(SoftwareCompositor::new(Layout::from(&config)));
    let mut mixer = AudioMixer::new(MixerConfig {
        sample_rate: config.sample_rate,
        channels: config.channels,
        ..MixerConfig::default()
    });

    let mut taps: Vec<AudioTap> = [
        (StreamOrigin::Local, local.clone()),
        (StreamOrigin::Remote, remote.clone()),
    ]
    .into_iter()
    .filter_map(|(origin, stream)| stream.map(|s| AudioTap::new(origin, s)))
    .collect();

    let mut interval = tokio::time::interval(config.frame_interval());
    let mut ticks: u64 = 0;
    let mut audio_frames_written: u64 = 0;

    debug!("Compositing loop started at {} fps", fps);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        if shared.state() != RecordingState::Recording {
            break;
        }

        ticks += 1;
        let timestamp_ms = shared.clock.lock().elapsed().as_millis() as u64;

        let latest = |stream: &Option<Arc<MediaStream>>| {
            stream
                .as_ref()
                .and_then(|s| s.video_track())
                .and_then(|t| t.latest_video())
        };
        let frame = compositor.compose(
            latest(&remote).as_ref(),
            latest(&local).as_ref(),
            timestamp_ms,
        );

        for tap in taps.iter_mut() {
            tap.drain_into(&mut mixer);
        }

        // Cumulative count keeps audio aligned with video when the rate doesn't divide evenly
        let due = ticks * sample_rate / fps;
        let audio = mixer.mix((due - audio_frames_written) as usize, timestamp_ms);
        audio_frames_written = due;

        let result = {
            let mut encoder = shared.encoder.lock();
            match encoder.as_mut() {
                Some(encoder) => encoder
                    .write_video(&frame)
                    .and_then(|_| encoder.write_audio(&audio)),
                None => break,
            }
        };

        if let Err(e) = result {
            warn!("Recording write failed: {}", e);
            shared.events.emit(RecordingEvent::Error(e));
        }
    }

    debug!("Compositing loop stopped after {} ticks", ticks);
}
