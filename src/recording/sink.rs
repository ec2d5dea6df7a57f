use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

use crate::error::RecordingError;

/// A finished recording
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub recording_id: String,
    /// Interview the call belonged to, filled in by the call before hand-off
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interview_id: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
    pub duration_seconds: f64,
    pub duration_ms: u64,
    pub mime_type: String,
    pub size_bytes: u64,
    pub video_frames: u64,
    pub started_at: DateTime<Utc>,
}

impl Artifact {
    pub fn extension(&self) -> &'static str {
        match self.mime_type.as_str() {
            "audio/wav" => "wav",
            "video/webm" => "webm",
            "video/mp4" => "mp4",
            _ => "bin",
        }
    }
}

/// Where finished recordings go (uploader, disk, ...)
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Persist `artifact`, returning where it ended up
    async fn store(&self, artifact: &Artifact) -> Result<String, RecordingError>;

    fn name(&self) -> &str;
}

/// Writes `<recording>-<timestamp>.<ext>` plus a JSON metadata sidecar
pub struct FileArtifactSink {
    output_dir: PathBuf,
}

impl FileArtifactSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

#[async_trait]
impl ArtifactSink for FileArtifactSink {
    async fn store(&self, artifact: &Artifact) -> Result<String, RecordingError> {
        let sink_err = |e: std::io::Error| RecordingError::Sink(e.to_string());

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(sink_err)?;

        let stem = format!(
            "{}-{}",
            artifact.recording_id,
            artifact.started_at.format("%Y%m%dT%H%M%SZ")
        );
        let media_path = self
            .output_dir
            .join(format!("{}.{}", stem, artifact.extension()));
        let meta_path = self.output_dir.join(format!("{}.json", stem));

        tokio::fs::write(&media_path, &artifact.bytes)
            .await
            .map_err(sink_err)?;

        let meta = serde_json::to_vec_pretty(artifact)
            .map_err(|e| RecordingError::Sink(e.to_string()))?;
        tokio::fs::write(&meta_path, meta).await.map_err(sink_err)?;

        info!(
            "Recording saved to {:?} ({} bytes, {:.1}s)",
            media_path, artifact.size_bytes, artifact.duration_seconds
        );

        Ok(media_path.display().to_string())
    }

    fn name(&self) -> &str {
        "file"
    }
}
