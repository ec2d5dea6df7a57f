use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};

use tempfile::TempDir;
use tracing::{debug, info};

use crate::config::{ContainerFormat, RecordingConfig};
use crate::error::RecordingError;
pub use crate::media::ffmpeg::ffmpeg_available;
use crate::media::{AudioFrame, VideoFrame};

use super::encoder::{EncodedOutput, EncoderFactory, MediaEncoder};

fn ffmpeg_err(context: &str, e: impl std::fmt::Display) -> RecordingError {
    RecordingError::Encoder(format!("{}: {}", context, e))
}

fn extension(format: ContainerFormat) -> &'static str {
    match format {
        ContainerFormat::Webm => "webm",
        ContainerFormat::Mp4 => "mp4",
        ContainerFormat::Wav => "wav",
    }
}

fn mime_type(format: ContainerFormat) -> &'static str {
    match format {
        ContainerFormat::Webm => "video/webm",
        ContainerFormat::Mp4 => "video/mp4",
        ContainerFormat::Wav => "audio/wav",
    }
}

fn video_codec_args(format: ContainerFormat) -> Vec<String> {
    let args: &[&str] = match format {
        // realtime deadline keeps VP8 ahead of the compositor
        ContainerFormat::Webm => &[
            "-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8", "-b:v", "1M",
        ],
        ContainerFormat::Mp4 => &["-c:v", "libx264", "-preset", "veryfast", "-crf", "23"],
        ContainerFormat::Wav => &[],
    };
    args.iter().map(|s| s.to_string()).collect()
}

fn audio_codec_args(format: ContainerFormat) -> Vec<String> {
    let args: &[&str] = match format {
        ContainerFormat::Webm => &["-c:a", "libopus", "-b:a", "96k"],
        ContainerFormat::Mp4 => &["-c:a", "aac", "-b:a", "128k", "-movflags", "+faststart"],
        ContainerFormat::Wav => &[],
    };
    args.iter().map(|s| s.to_string()).collect()
}

fn run(ffmpeg: &str, args: &[String]) -> Result<(), RecordingError> {
    let output = Command::new(ffmpeg)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| ffmpeg_err("failed to start ffmpeg", e))?;

    if !output.status.success() {
        return Err(RecordingError::Encoder(format!(
            "ffmpeg exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

struct VideoPipe {
    process: Child,
    stdin: ChildStdin,
}

/// WebM/MP4 encoder backed by an ffmpeg child process
///
/// Composited RGBA frames are piped into ffmpeg's stdin as they arrive and
/// the mixed audio is spooled to a WAV file next to the video. `finish`
/// closes the pipe and muxes both into the final container.
pub struct FfmpegEncoder {
    ffmpeg: String,
    format: ContainerFormat,
    width: u32,
    height: u32,
    workdir: TempDir,
    video: Option<VideoPipe>,
    audio: Option<hound::WavWriter<BufWriter<File>>>,
    audio_spec: hound::WavSpec,
    video_frames: u64,
}

impl FfmpegEncoder {
    pub fn new(
        ffmpeg: &str,
        format: ContainerFormat,
        config: &RecordingConfig,
    ) -> Result<Self, RecordingError> {
        if format == ContainerFormat::Wav {
            return Err(RecordingError::Encoder(
                "wav is not a video container".to_string(),
            ));
        }

        let workdir = tempfile::Builder::new()
            .prefix("interview-rtc-")
            .tempdir()
            .map_err(|e| ffmpeg_err("failed to create work dir", e))?;

        let audio_spec = hound::WavSpec {
            channels: config.channels,
            sample_rate: config.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let audio = hound::WavWriter::create(workdir.path().join("audio.wav"), audio_spec)
            .map_err(|e| ffmpeg_err("failed to open audio spool", e))?;

        let video_path = workdir.path().join(format!("video.{}", extension(format)));
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-f".to_string(),
            "rawvideo".to_string(),
            "-pix_fmt".to_string(),
            "rgba".to_string(),
            "-s".to_string(),
            format!("{}x{}", config.width, config.height),
            "-r".to_string(),
            config.fps.max(1).to_string(),
            "-i".to_string(),
            "-".to_string(),
            "-an".to_string(),
            // 4:2:0 needs even dimensions
            "-vf".to_string(),
            "pad=ceil(iw/2)*2:ceil(ih/2)*2".to_string(),
            "-pix_fmt".to_string(),
            "yuv420p".to_string(),
        ];
        args.extend(video_codec_args(format));
        args.push(video_path.to_string_lossy().to_string());

        info!("Starting ffmpeg video encoder: {:?}", args);

        let mut process = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ffmpeg_err("failed to start ffmpeg", e))?;

        let stdin = process
            .stdin
            .take()
            .ok_or_else(|| RecordingError::Encoder("failed to capture ffmpeg stdin".to_string()))?;

        Ok(Self {
            ffmpeg: ffmpeg.to_string(),
            format,
            width: config.width,
            height: config.height,
            workdir,
            video: Some(VideoPipe { process, stdin }),
            audio: Some(audio),
            audio_spec,
            video_frames: 0,
        })
    }

    fn close_video(&mut self) -> Result<(), RecordingError> {
        let VideoPipe { process, stdin } = self
            .video
            .take()
            .ok_or_else(|| RecordingError::Encoder("video pipe already closed".to_string()))?;

        // EOF tells ffmpeg to flush and exit
        drop(stdin);

        let output = process
            .wait_with_output()
            .map_err(|e| ffmpeg_err("failed to wait for ffmpeg", e))?;
        if !output.status.success() {
            return Err(RecordingError::Encoder(format!(
                "ffmpeg exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    fn mux(&self, output: &Path) -> Result<(), RecordingError> {
        let dir = self.workdir.path();
        let mut args = vec![
            "-y".to_string(),
            "-loglevel".to_string(),
            "error".to_string(),
            "-i".to_string(),
            dir.join(format!("video.{}", extension(self.format)))
                .to_string_lossy()
                .to_string(),
            "-i".to_string(),
            dir.join("audio.wav").to_string_lossy().to_string(),
            "-map".to_string(),
            "0:v:0".to_string(),
            "-map".to_string(),
            "1:a:0".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
        ];
        args.extend(audio_codec_args(self.format));
        args.push(output.to_string_lossy().to_string());

        debug!("Muxing recording: {:?}", args);
        run(&self.ffmpeg, &args)
    }
}

impl MediaEncoder for FfmpegEncoder {
    fn write_video(&mut self, frame: &VideoFrame) -> Result<(), RecordingError> {
        if frame.width != self.width || frame.height != self.height {
            return Err(RecordingError::Encoder(format!(
                "expected {}x{} video, got {}x{}",
                self.width, self.height, frame.width, frame.height
            )));
        }
        let pipe = self
            .video
            .as_mut()
            .ok_or_else(|| RecordingError::Encoder("video pipe closed".to_string()))?;
        pipe.stdin
            .write_all(&frame.data)
            .map_err(|e| ffmpeg_err("failed to write frame", e))?;
        self.video_frames += 1;
        Ok(())
    }

    fn write_audio(&mut self, frame: &AudioFrame) -> Result<(), RecordingError> {
        if frame.sample_rate != self.audio_spec.sample_rate
            || frame.channels != self.audio_spec.channels
        {
            return Err(RecordingError::Encoder(format!(
                "expected {}Hz/{}ch audio, got {}Hz/{}ch",
                self.audio_spec.sample_rate,
                self.audio_spec.channels,
                frame.sample_rate,
                frame.channels
            )));
        }
        let writer = self
            .audio
            .as_mut()
            .ok_or_else(|| RecordingError::Encoder("audio spool closed".to_string()))?;
        for sample in &frame.samples {
            writer
                .write_sample(*sample)
                .map_err(|e| ffmpeg_err("failed to spool audio", e))?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> Result<EncodedOutput, RecordingError> {
        if self.video_frames == 0 {
            // ffmpeg can't build a video stream from an empty pipe
            let black = VideoFrame::solid(self.width, self.height, [0, 0, 0, 255], 0);
            self.write_video(&black)?;
        }
        self.close_video()?;

        if let Some(audio) = self.audio.take() {
            audio
                .finalize()
                .map_err(|e| ffmpeg_err("failed to finalize audio spool", e))?;
        }

        let output = self
            .workdir
            .path()
            .join(format!("recording.{}", extension(self.format)));
        self.mux(&output)?;

        let bytes = std::fs::read(&output).map_err(|e| ffmpeg_err("failed to read recording", e))?;
        info!(
            "{} encoded: {} bytes, {} video frames",
            extension(self.format),
            bytes.len(),
            self.video_frames
        );

        Ok(EncodedOutput {
            bytes,
            mime_type: mime_type(self.format).to_string(),
            video_frames: self.video_frames,
        })
    }

    fn mime_type(&self) -> &str {
        mime_type(self.format)
    }
}

impl Drop for FfmpegEncoder {
    fn drop(&mut self) {
        // Abandoned recordings must not leave ffmpeg running
        if let Some(mut pipe) = self.video.take() {
            let _ = pipe.process.kill();
            let _ = pipe.process.wait();
        }
    }
}

pub struct FfmpegEncoderFactory {
    ffmpeg: String,
    format: ContainerFormat,
}

impl FfmpegEncoderFactory {
    pub fn new(ffmpeg: impl Into<String>, format: ContainerFormat) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            format,
        }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self, config: &RecordingConfig) -> Result<Box<dyn MediaEncoder>, RecordingError> {
        Ok(Box::new(FfmpegEncoder::new(&self.ffmpeg, self.format, config)?))
    }

    fn name(&self) -> &str {
        extension(self.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::StreamOrigin;

    fn small_config() -> RecordingConfig {
        RecordingConfig {
            fps: 10,
            width: 64,
            height: 36,
            sample_rate: 48_000,
            channels: 1,
            ..RecordingConfig::default()
        }
    }

    /// Decode the audio stream of `path` to 16-bit PCM
    fn decode_audio(path: &Path) -> Vec<u8> {
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-map", "0:a:0", "-f", "s16le", "-ac", "1", "pipe:1"])
            .output()
            .unwrap();
        assert!(output.status.success());
        output.stdout
    }

    /// Decode every frame of `path` back to RGBA
    fn decode_frames(path: &Path, width: u32, height: u32) -> Vec<Vec<u8>> {
        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-i"])
            .arg(path)
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .output()
            .unwrap();
        assert!(output.status.success());
        output
            .stdout
            .chunks((width * height * 4) as usize)
            .map(|c| c.to_vec())
            .collect()
    }

    fn encode(format: ContainerFormat, frames: u64) -> EncodedOutput {
        let config = small_config();
        let mut encoder: Box<dyn MediaEncoder> =
            Box::new(FfmpegEncoder::new("ffmpeg", format, &config).unwrap());
        for i in 0..frames {
            encoder
                .write_video(&VideoFrame::solid(64, 36, [220, 20, 20, 255], i * 100))
                .unwrap();
            encoder
                .write_audio(&AudioFrame {
                    samples: (0..4800).map(|n| ((n % 48) as i16 - 24) * 500).collect(),
                    sample_rate: 48_000,
                    channels: 1,
                    timestamp_ms: i * 100,
                    origin: StreamOrigin::Local,
                })
                .unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn test_webm_carries_composited_video_and_audio() {
        if !ffmpeg_available("ffmpeg") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }

        let output = encode(ContainerFormat::Webm, 10);
        assert_eq!(output.mime_type, "video/webm");
        assert_eq!(output.video_frames, 10);
        // EBML header
        assert_eq!(&output.bytes[..4], &[0x1A, 0x45, 0xDF, 0xA3]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.webm");
        std::fs::write(&path, &output.bytes).unwrap();

        // One second of spooled audio survives the Opus round trip
        let pcm = decode_audio(&path);
        assert!(pcm.len() >= 48_000 * 2 * 9 / 10, "{} audio bytes", pcm.len());

        let frames = decode_frames(&path, 64, 36);
        assert_eq!(frames.len(), 10);
        let center = ((18 * 64 + 32) * 4) as usize;
        let pixel = &frames[5][center..center + 3];
        assert!(pixel[0] > 150 && pixel[1] < 90 && pixel[2] < 90, "pixel {:?}", pixel);
    }

    #[test]
    fn test_mp4_output() {
        if !ffmpeg_available("ffmpeg") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }

        let output = encode(ContainerFormat::Mp4, 5);
        assert_eq!(output.mime_type, "video/mp4");
        assert_eq!(&output.bytes[4..8], b"ftyp");
    }

    #[test]
    fn test_empty_recording_still_has_a_video_stream() {
        if !ffmpeg_available("ffmpeg") {
            eprintln!("ffmpeg not installed, skipping");
            return;
        }

        let output = encode(ContainerFormat::Webm, 0);
        assert_eq!(output.video_frames, 1);
    }

    #[test]
    fn test_rejects_wrong_frame_size_and_wav() {
        assert!(FfmpegEncoder::new("ffmpeg", ContainerFormat::Wav, &small_config()).is_err());

        if !ffmpeg_available("ffmpeg") {
            return;
        }
        let mut encoder = FfmpegEncoder::new("ffmpeg", ContainerFormat::Webm, &small_config()).unwrap();
        let err = encoder
            .write_video(&VideoFrame::solid(32, 18, [0, 0, 0, 255], 0))
            .unwrap_err();
        assert!(matches!(err, RecordingError::Encoder(_)));
    }

    #[test]
    fn test_missing_binary() {
        assert!(!ffmpeg_available("/nonexistent/ffmpeg"));
        assert!(FfmpegEncoder::new("/nonexistent/ffmpeg", ContainerFormat::Webm, &small_config()).is_err());
    }
}
