use parking_lot::RwLock;
use std::sync::Arc;

use super::track::{MediaTrack, StreamOrigin, TrackKind};

/// Identity-stable container of at most one track per kind
///
/// Tracks can be swapped underneath without invalidating the stream, so
/// readers holding an `Arc<MediaStream>` always see the current track.
#[derive(Debug)]
pub struct MediaStream {
    id: String,
    origin: StreamOrigin,
    tracks: RwLock<Vec<Arc<MediaTrack>>>,
}

impl MediaStream {
    pub fn new(origin: StreamOrigin) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            origin,
            tracks: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn origin(&self) -> StreamOrigin {
        self.origin
    }

    pub fn track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        self.tracks.read().iter().find(|t| t.kind() == kind).cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Audio)
    }

    pub fn video_track(&self) -> Option<Arc<MediaTrack>> {
        self.track(TrackKind::Video)
    }

    pub fn tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.tracks.read().clone()
    }

    /// Insert `track`, replacing any track of the same kind
    ///
    /// Returns the replaced track. The caller decides whether to stop it.
    pub fn set_track(&self, track: Arc<MediaTrack>) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        let previous = tracks
            .iter()
            .position(|t| t.kind() == track.kind())
            .map(|i| tracks.remove(i));
        tracks.push(track);
        previous
    }

    pub fn remove_track(&self, kind: TrackKind) -> Option<Arc<MediaTrack>> {
        let mut tracks = self.tracks.write();
        tracks
            .iter()
            .position(|t| t.kind() == kind)
            .map(|i| tracks.remove(i))
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    /// Stop every track. Only the owner of the tracks may call this.
    pub fn stop_all(&self) {
        for track in self.tracks.read().iter() {
            track.stop();
        }
    }
}
