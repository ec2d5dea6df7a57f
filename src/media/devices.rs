use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::source::{DeviceInfo, MediaSource};
use super::stream::MediaStream;
use super::track::{MediaTrack, StreamOrigin, TrackKind};
use crate::error::DeviceError;
use crate::events::{Event, EventDispatcher, Subscription};
use crate::negotiation::PeerConnection;

/// What the remote side should show for our outbound media
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaState {
    pub audio_enabled: bool,
    pub video_enabled: bool,
}

#[derive(Debug, Clone)]
pub enum DeviceEvent {
    MediaStateChanged(MediaState),
    TrackReplaced { kind: TrackKind, track_id: String },
    Error(DeviceError),
}

impl Event for DeviceEvent {
    fn name(&self) -> &'static str {
        match self {
            DeviceEvent::MediaStateChanged(_) => "media-state",
            DeviceEvent::TrackReplaced { .. } => "track-replaced",
            DeviceEvent::Error(_) => "error",
        }
    }
}

/// Owns the local stream and swaps its tracks in place
///
/// Soft toggles only flip a track's enabled flag. Anything that needs a new
/// track (device switch, re-enable after a hard stop) acquires it first and
/// hands it to the attached PeerConnection's sender, so no renegotiation is
/// needed. Failures leave the previous track as it was.
pub struct DeviceManager {
    source: Arc<dyn MediaSource>,
    stream: Arc<MediaStream>,
    peer: RwLock<Option<Arc<PeerConnection>>>,
    /// Last device chosen per kind, reused on re-acquisition
    selected: Mutex<HashMap<TrackKind, String>>,
    /// Serializes toggles and switches
    ops: tokio::sync::Mutex<()>,
    events: Arc<EventDispatcher<DeviceEvent>>,
}

impl DeviceManager {
    pub fn new(source: Arc<dyn MediaSource>) -> Self {
        info!("Device manager using {} media source", source.name());

        Self {
            source,
            stream: Arc::new(MediaStream::new(StreamOrigin::Local)),
            peer: RwLock::new(None),
            selected: Mutex::new(HashMap::new()),
            ops: tokio::sync::Mutex::new(()),
            events: Arc::new(EventDispatcher::new("devices")),
        }
    }

    /// Acquire the initial tracks
    ///
    /// A kind that cannot be acquired is reported as an error event and left
    /// out; the call can still go ahead with what is available.
    pub async fn start(&self, audio: bool, video: bool) -> Arc<MediaStream> {
        let _guard = self.ops.lock().await;

        for (kind, wanted) in [(TrackKind::Audio, audio), (TrackKind::Video, video)] {
            if !wanted || self.stream.track(kind).map_or(false, |t| t.is_live()) {
                continue;
            }
            match self.acquire(kind).await {
                Ok(track) => {
                    if let Some(previous) = self.stream.set_track(track) {
                        previous.stop();
                    }
                }
                Err(e) => self.report(e),
            }
        }

        self.stream.clone()
    }

    /// The local stream; its identity never changes
    pub fn local_stream(&self) -> Arc<MediaStream> {
        self.stream.clone()
    }

    /// Route future track replacements to `peer`
    pub fn attach(&self, peer: Arc<PeerConnection>) {
        debug!("Devices attached to peer {}", peer.id());
        *self.peer.write() = Some(peer);
    }

    pub fn detach(&self) {
        if self.peer.write().take().is_some() {
            debug!("Devices detached from peer");
        }
    }

    pub fn media_state(&self) -> MediaState {
        let enabled = |kind| {
            self.stream
                .track(kind)
                .map_or(false, |t| t.is_live() && t.is_enabled())
        };
        MediaState {
            audio_enabled: enabled(TrackKind::Audio),
            video_enabled: enabled(TrackKind::Video),
        }
    }

    pub fn list_devices(&self, kind: TrackKind) -> Vec<DeviceInfo> {
        self.source.devices(kind)
    }

    /// Enable or disable outbound media of `kind`
    ///
    /// Returns false only when re-enabling needed a new track and that failed.
    pub async fn toggle(&self, kind: TrackKind, enabled: bool) -> bool {
        let _guard = self.ops.lock().await;
        let current = self.stream.track(kind).filter(|t| !t.is_stopped());

        if !enabled {
            if let Some(track) = current {
                if track.set_enabled(false) {
                    info!("Disabled local {} track {}", kind, track.id());
                    self.emit_media_state();
                }
            }
            return true;
        }

        // Soft-disabled: same track comes back
        if let Some(track) = current {
            if track.set_enabled(true) {
                info!("Re-enabled local {} track {}", kind, track.id());
                self.emit_media_state();
            }
            return true;
        }

        // Hard-stopped or never acquired: needs a new track
        let track = match self.acquire(kind).await {
            Ok(track) => track,
            Err(e) => {
                self.report(e);
                return false;
            }
        };
        if let Err(e) = self.replace_on_peer(kind, Some(track.clone())).await {
            track.stop();
            self.report(e);
            return false;
        }

        if let Some(previous) = self.stream.set_track(track.clone()) {
            previous.stop();
        }
        info!("Re-acquired local {} track {}", kind, track.id());
        self.events.emit(DeviceEvent::TrackReplaced {
            kind,
            track_id: track.id().to_string(),
        });
        self.emit_media_state();
        true
    }

    /// Move outbound media of `kind` to another device
    ///
    /// The new track inherits the enabled state of the one it replaces.
    pub async fn switch_device(&self, kind: TrackKind, device_id: &str) -> bool {
        let _guard = self.ops.lock().await;
        let previous = self.stream.track(kind);

        let track = match self.source.acquire(kind, Some(device_id)).await {
            Ok(track) => track,
            Err(e) => {
                self.report(e);
                return false;
            }
        };

        let enabled = previous
            .as_ref()
            .map_or(true, |t| t.is_live() && t.is_enabled());
        track.set_enabled(enabled);

        if let Err(e) = self.replace_on_peer(kind, Some(track.clone())).await {
            track.stop();
            self.report(e);
            return false;
        }

        if let Some(old) = self.stream.set_track(track.clone()) {
            old.stop();
        }
        self.selected.lock().insert(kind, device_id.to_string());

        info!("Switched local {} to device {}", kind, device_id);
        self.events.emit(DeviceEvent::TrackReplaced {
            kind,
            track_id: track.id().to_string(),
        });
        if previous.map_or(true, |t| !t.is_live()) && enabled {
            self.emit_media_state();
        }
        true
    }

    /// Release the device behind `kind`; re-enabling acquires a new track
    pub async fn stop_track(&self, kind: TrackKind) -> bool {
        let _guard = self.ops.lock().await;
        let Some(track) = self.stream.track(kind) else {
            return false;
        };
        if !track.stop() {
            return false;
        }

        if let Err(e) = self.replace_on_peer(kind, None).await {
            warn!("Clearing outbound {} sender failed: {}", kind, e);
        }

        info!("Stopped local {} track {}", kind, track.id());
        self.emit_media_state();
        true
    }

    /// Stop every local track
    pub fn shutdown(&self) {
        self.detach();
        self.stream.stop_all();
    }

    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> Subscription
    where
        F: Fn(&DeviceEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.subscribe(name, handler)
    }

    pub fn unsubscribe(&self, subscription: Subscription) -> bool {
        self.events.unsubscribe(subscription)
    }

    pub fn events(&self) -> &Arc<EventDispatcher<DeviceEvent>> {
        &self.events
    }

    async fn acquire(&self, kind: TrackKind) -> Result<Arc<MediaTrack>, DeviceError> {
        let device_id = self.selected.lock().get(&kind).cloned();
        let track = self.source.acquire(kind, device_id.as_deref()).await?;
        if let Some(id) = track.device_id() {
            self.selected.lock().insert(kind, id.to_string());
        }
        Ok(track)
    }

    async fn replace_on_peer(
        &self,
        kind: TrackKind,
        track: Option<Arc<MediaTrack>>,
    ) -> Result<(), DeviceError> {
        let peer = self.peer.read().clone();
        let Some(peer) = peer else {
            return Ok(());
        };

        peer.replace_outbound_track(kind, track)
            .await
            .map_err(|e| DeviceError::Replace {
                kind,
                reason: e.to_string(),
            })
    }

    fn report(&self, error: DeviceError) {
        warn!("Device error: {}", error);
        self.events.emit(DeviceEvent::Error(error));
    }

    fn emit_media_state(&self) {
        self.events
            .emit(DeviceEvent::MediaStateChanged(self.media_state()));
    }
}
