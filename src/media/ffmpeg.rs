//! VP8 and Opus codecs backed by ffmpeg child processes
//!
//! Each codec is one long-running ffmpeg process: input is written to its
//! stdin and a reader thread parses stdout into samples or frames, which
//! `encode`/`decode` drain without waiting. Encoders emit IVF (VP8) and Ogg
//! (Opus) streams; decoders are fed the same framing.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::media::io::ivf_reader::IVFReader;

use super::codec::{CodecFactory, FrameFormat, MediaFrame, SampleDecoder, SampleEncoder};
use super::ogg::{self, OggPacketReader, OggPageWriter};
use super::track::{AudioFrame, EncodedSample, StreamOrigin, TrackKind, VideoFrame};
use crate::config::DevicesConfig;
use crate::error::CodecError;

const VP8: &str = "vp8";
const OPUS: &str = "opus";

/// Opus frame length on the wire
const OPUS_FRAME: Duration = Duration::from_millis(20);

/// Whether `ffmpeg` starts and answers `-version`
pub fn ffmpeg_available(ffmpeg: &str) -> bool {
    Command::new(ffmpeg)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// A codec process plus the thread turning its stdout into `T`s
struct Transcoder<T> {
    codec: &'static str,
    process: Child,
    stdin: Option<ChildStdin>,
    output: mpsc::UnboundedReceiver<T>,
}

impl<T: Send + 'static> Transcoder<T> {
    fn spawn<F>(
        codec: &'static str,
        ffmpeg: &str,
        args: Vec<String>,
        read: F,
    ) -> Result<Self, CodecError>
    where
        F: FnOnce(ChildStdout, mpsc::UnboundedSender<T>) + Send + 'static,
    {
        let start_err = |reason: String| CodecError::Start { codec, reason };

        debug!("Starting {} codec: {} {:?}", codec, ffmpeg, args);
        let mut process = Command::new(ffmpeg)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| start_err(e.to_string()))?;

        let stdin = process.stdin.take();
        let stdout = process
            .stdout
            .take()
            .ok_or_else(|| start_err("stdout not captured".to_string()))?;

        let (tx, output) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name(format!("{}-reader", codec))
            .spawn(move || read(stdout, tx))
            .map_err(|e| start_err(e.to_string()))?;

        Ok(Self {
            codec,
            process,
            stdin,
            output,
        })
    }

    fn write(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let codec = self.codec;
        let stdin = self.stdin.as_mut().ok_or_else(|| CodecError::Stream {
            codec,
            reason: "input closed".to_string(),
        })?;
        stdin
            .write_all(data)
            .and_then(|_| stdin.flush())
            .map_err(|e| CodecError::Stream {
                codec,
                reason: e.to_string(),
            })
    }

    fn drain(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Ok(item) = self.output.try_recv() {
            ready.push(item);
        }
        ready
    }
}

impl<T> Drop for Transcoder<T> {
    fn drop(&mut self) {
        self.stdin.take();
        let _ = self.process.kill();
        let _ = self.process.wait();
    }
}

fn check_video(format: &FrameFormat, frame: &VideoFrame) -> Result<(), CodecError> {
    if frame.width != format.width || frame.height != format.height {
        return Err(CodecError::Format {
            codec: VP8,
            expected: format!("{}x{}", format.width, format.height),
            actual: format!("{}x{}", frame.width, frame.height),
        });
    }
    Ok(())
}

fn check_audio(format: &FrameFormat, frame: &AudioFrame) -> Result<(), CodecError> {
    if frame.sample_rate != format.sample_rate || frame.channels != format.channels {
        return Err(CodecError::Format {
            codec: OPUS,
            expected: format!("{}Hz/{}ch", format.sample_rate, format.channels),
            actual: format!("{}Hz/{}ch", frame.sample_rate, frame.channels),
        });
    }
    Ok(())
}

fn wrong_kind(codec: &'static str, expected: TrackKind, frame: &MediaFrame) -> CodecError {
    CodecError::Format {
        codec,
        expected: expected.to_string(),
        actual: frame.kind().to_string(),
    }
}

/// RGBA frames to VP8 samples
pub struct Vp8Encoder {
    format: FrameFormat,
    transcoder: Transcoder<EncodedSample>,
}

impl Vp8Encoder {
    pub fn new(ffmpeg: &str, format: &FrameFormat) -> Result<Self, CodecError> {
        let fps = format.fps.max(1);
        let mut list = args(&["-loglevel", "error", "-f", "rawvideo", "-pix_fmt", "rgba"]);
        list.extend([
            "-s".to_string(),
            format!("{}x{}", format.width, format.height),
            "-r".to_string(),
            fps.to_string(),
        ]);
        list.extend(args(&[
            "-i", "-", "-an", "-vf", "pad=ceil(iw/2)*2:ceil(ih/2)*2", "-pix_fmt", "yuv420p",
            "-c:v", "libvpx", "-deadline", "realtime", "-cpu-used", "8", "-b:v", "1M",
            "-lag-in-frames", "0", "-auto-alt-ref", "0",
        ]));
        // Regular keyframes let a late decoder start
        list.extend(["-g".to_string(), (fps * 2).to_string()]);
        list.extend(args(&["-flush_packets", "1", "-f", "ivf", "-"]));

        let duration = Duration::from_secs(1) / fps;
        let transcoder = Transcoder::spawn(VP8, ffmpeg, list, move |stdout, tx| {
            let Ok((mut reader, _)) = IVFReader::new(BufReader::new(stdout)) else {
                return;
            };
            while let Ok((frame, _)) = reader.parse_next_frame() {
                let sample = EncodedSample {
                    data: frame.freeze(),
                    duration,
                };
                if tx.send(sample).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            format: *format,
            transcoder,
        })
    }
}

impl SampleEncoder for Vp8Encoder {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedSample>, CodecError> {
        let MediaFrame::Video(video) = frame else {
            return Err(wrong_kind(VP8, TrackKind::Video, frame));
        };
        check_video(&self.format, video)?;
        self.transcoder.write(&video.data)?;
        Ok(self.transcoder.drain())
    }
}

/// VP8 samples back to RGBA frames of the configured size
pub struct Vp8Decoder {
    format: FrameFormat,
    transcoder: Transcoder<VideoFrame>,
    header_written: bool,
    frames_in: u64,
}

impl Vp8Decoder {
    pub fn new(ffmpeg: &str, format: &FrameFormat) -> Result<Self, CodecError> {
        let (width, height) = (format.width, format.height);
        let mut list = args(&[
            "-loglevel", "error", "-analyzeduration", "100000", "-fflags", "nobuffer", "-f",
            "ivf", "-i", "-", "-an",
        ]);
        // Remote resolution may differ; frames come out at the local size
        list.extend(["-vf".to_string(), format!("scale={}:{}", width, height)]);
        list.extend(args(&["-pix_fmt", "rgba", "-flush_packets", "1", "-f", "rawvideo", "-"]));

        let started = Instant::now();
        let transcoder = Transcoder::spawn(VP8, ffmpeg, list, move |stdout, tx| {
            let mut stdout = BufReader::new(stdout);
            let mut buf = vec![0u8; (width * height * 4) as usize];
            while stdout.read_exact(&mut buf).is_ok() {
                let frame = VideoFrame {
                    width,
                    height,
                    data: Bytes::copy_from_slice(&buf),
                    timestamp_ms: started.elapsed().as_millis() as u64,
                };
                if tx.send(frame).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            format: *format,
            transcoder,
            header_written: false,
            frames_in: 0,
        })
    }

    fn ivf_header(&self) -> Bytes {
        let mut header = BytesMut::with_capacity(32);
        header.put_slice(b"DKIF");
        header.put_u16_le(0);
        header.put_u16_le(32);
        header.put_slice(b"VP80");
        header.put_u16_le(self.format.width as u16);
        header.put_u16_le(self.format.height as u16);
        header.put_u32_le(self.format.fps.max(1));
        header.put_u32_le(1);
        header.put_u32_le(0);
        header.put_u32_le(0);
        header.freeze()
    }
}

impl SampleDecoder for Vp8Decoder {
    fn decode(&mut self, sample: &EncodedSample) -> Result<Vec<MediaFrame>, CodecError> {
        if !self.header_written {
            let header = self.ivf_header();
            self.transcoder.write(&header)?;
            self.header_written = true;
        }

        let mut record = BytesMut::with_capacity(12 + sample.data.len());
        record.put_u32_le(sample.data.len() as u32);
        record.put_u64_le(self.frames_in);
        record.put_slice(&sample.data);
        self.transcoder.write(&record)?;
        self.frames_in += 1;

        Ok(self
            .transcoder
            .drain()
            .into_iter()
            .map(MediaFrame::Video)
            .collect())
    }
}

/// PCM frames to 20 ms Opus packets
pub struct OpusEncoder {
    format: FrameFormat,
    transcoder: Transcoder<EncodedSample>,
}

impl OpusEncoder {
    pub fn new(ffmpeg: &str, format: &FrameFormat) -> Result<Self, CodecError> {
        let mut list = args(&["-loglevel", "error", "-f", "s16le"]);
        list.extend([
            "-ar".to_string(),
            format.sample_rate.to_string(),
            "-ac".to_string(),
            format.channels.to_string(),
        ]);
        list.extend(args(&[
            "-i", "-", "-c:a", "libopus", "-application", "voip", "-frame_duration", "20",
            "-page_duration", "20000", "-flush_packets", "1", "-f", "ogg", "-",
        ]));

        let transcoder = Transcoder::spawn(OPUS, ffmpeg, list, |stdout, tx| {
            let mut packets = OggPacketReader::new(BufReader::new(stdout));
            while let Ok(Some(packet)) = packets.next_packet() {
                if ogg::is_opus_header(&packet) {
                    continue;
                }
                let sample = EncodedSample {
                    data: packet,
                    duration: OPUS_FRAME,
                };
                if tx.send(sample).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            format: *format,
            transcoder,
        })
    }
}

impl SampleEncoder for OpusEncoder {
    fn encode(&mut self, frame: &MediaFrame) -> Result<Vec<EncodedSample>, CodecError> {
        let MediaFrame::Audio(audio) = frame else {
            return Err(wrong_kind(OPUS, TrackKind::Audio, frame));
        };
        check_audio(&self.format, audio)?;
        let mut pcm = BytesMut::with_capacity(audio.samples.len() * 2);
        for sample in &audio.samples {
            pcm.put_i16_le(*sample);
        }
        self.transcoder.write(&pcm)?;
        Ok(self.transcoder.drain())
    }
}

/// Opus packets back to 20 ms PCM frames in the local format
pub struct OpusDecoder {
    transcoder: Transcoder<AudioFrame>,
    pages: OggPageWriter<Vec<u8>>,
    header_written: bool,
    channels: u8,
    granule: u64,
}

impl OpusDecoder {
    pub fn new(ffmpeg: &str, format: &FrameFormat) -> Result<Self, CodecError> {
        let (sample_rate, channels) = (format.sample_rate, format.channels);
        let mut list = args(&[
            "-loglevel", "error", "-analyzeduration", "100000", "-fflags", "nobuffer", "-f",
            "ogg", "-i", "-",
        ]);
        list.extend([
            "-ar".to_string(),
            sample_rate.to_string(),
            "-ac".to_string(),
            channels.to_string(),
        ]);
        list.extend(args(&["-flush_packets", "1", "-f", "s16le", "-"]));

        let transcoder = Transcoder::spawn(OPUS, ffmpeg, list, move |stdout, tx| {
            let mut stdout = BufReader::new(stdout);
            let frame_len = (sample_rate as usize / 50) * channels as usize;
            let mut buf = vec![0u8; frame_len * 2];
            let mut timestamp_ms = 0u64;
            while stdout.read_exact(&mut buf).is_ok() {
                let frame = AudioFrame {
                    samples: buf
                        .chunks_exact(2)
                        .map(|b| i16::from_le_bytes([b[0], b[1]]))
                        .collect(),
                    sample_rate,
                    channels,
                    timestamp_ms,
                    origin: StreamOrigin::Remote,
                };
                timestamp_ms += OPUS_FRAME.as_millis() as u64;
                if tx.send(frame).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            transcoder,
            pages: OggPageWriter::new(Vec::new(), uuid::Uuid::new_v4().as_u128() as u32),
            header_written: false,
            channels: channels.min(2) as u8,
            granule: 0,
        })
    }

    fn flush_pages(&mut self) -> Result<(), CodecError> {
        let pages = std::mem::take(self.pages.get_mut());
        self.transcoder.write(&pages)
    }

    fn page_err(e: std::io::Error) -> CodecError {
        CodecError::Stream {
            codec: OPUS,
            reason: e.to_string(),
        }
    }
}

impl SampleDecoder for OpusDecoder {
    fn decode(&mut self, sample: &EncodedSample) -> Result<Vec<MediaFrame>, CodecError> {
        if !self.header_written {
            self.pages
                .write_packet(&ogg::opus_head(self.channels, 48_000), 0)
                .map_err(Self::page_err)?;
            self.pages
                .write_packet(&ogg::opus_tags(), 0)
                .map_err(Self::page_err)?;
            self.header_written = true;
        }

        // Granule positions count 48 kHz samples regardless of the output rate
        let duration = if sample.duration.is_zero() {
            OPUS_FRAME
        } else {
            sample.duration
        };
        self.granule += duration.as_micros() as u64 * 48 / 1000;
        self.pages
            .write_packet(&sample.data, self.granule)
            .map_err(Self::page_err)?;
        self.flush_pages()?;

        Ok(self
            .transcoder
            .drain()
            .into_iter()
            .map(MediaFrame::Audio)
            .collect())
    }
}

/// VP8 video and Opus audio through an ffmpeg binary
pub struct FfmpegCodecFactory {
    ffmpeg: String,
}

impl FfmpegCodecFactory {
    pub fn new(ffmpeg: impl Into<String>) -> Self {
        let ffmpeg = ffmpeg.into();
        info!("Transcoding media with {}", ffmpeg);
        Self { ffmpeg }
    }
}

impl CodecFactory for FfmpegCodecFactory {
    fn encoder(
        &self,
        kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleEncoder>, CodecError> {
        Ok(match kind {
            TrackKind::Video => Box::new(Vp8Encoder::new(&self.ffmpeg, format)?),
            TrackKind::Audio => Box::new(OpusEncoder::new(&self.ffmpeg, format)?),
        })
    }

    fn decoder(
        &self,
        kind: TrackKind,
        format: &FrameFormat,
    ) -> Result<Box<dyn SampleDecoder>, CodecError> {
        Ok(match kind {
            TrackKind::Video => Box::new(Vp8Decoder::new(&self.ffmpeg, format)?),
            TrackKind::Audio => Box::new(OpusDecoder::new(&self.ffmpeg, format)?),
        })
    }

    fn name(&self) -> &str {
        "ffmpeg"
    }
}

/// Codecs for `config`, None when transcoding is off or ffmpeg is missing
pub fn codec_factory(config: &DevicesConfig) -> Option<Arc<dyn CodecFactory>> {
    if !config.transcode {
        return None;
    }
    if !ffmpeg_available(&config.ffmpeg_path) {
        warn!(
            "{} not available, tracks carry raw frames only",
            config.ffmpeg_path
        );
        return None;
    }
    Some(Arc::new(FfmpegCodecFactory::new(&config.ffmpeg_path)))
}
