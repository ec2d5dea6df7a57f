// Audio mixer for the recording pipeline
//
// Combines the local and remote audio of a call into one track:
// - Local: this participant's microphone
// - Remote: the other participant
//
// Frames are queued per side and drained in tick-sized blocks, which are
// summed sample by sample with clipping. A side with nothing queued
// contributes silence.

use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use crate::media::{AudioFrame, StreamOrigin};

/// Configuration for audio mixer
#[derive(Debug, Clone)]
pub struct MixerConfig {
    /// Output sample rate; frames at other rates are dropped
    pub sample_rate: u32,
    /// Output channel count; frames with other layouts are dropped
    pub channels: u16,
    /// Maximum queued audio per side in milliseconds (default: 200ms)
    /// Older samples are dropped to keep the sides aligned
    pub max_buffer_delay_ms: u64,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            max_buffer_delay_ms: 200,
        }
    }
}

/// Audio mixer that combines the two sides of a call
pub struct AudioMixer {
    config: MixerConfig,
    /// Interleaved samples waiting to be mixed, per side
    buffers: HashMap<StreamOrigin, VecDeque<i16>>,
}

impl AudioMixer {
    pub fn new(config: MixerConfig) -> Self {
        info!(
            "Audio mixer initialized: {}Hz, {} channels",
            config.sample_rate, config.channels
        );

        let mut buffers = HashMap::new();
        buffers.insert(StreamOrigin::Local, VecDeque::new());
        buffers.insert(StreamOrigin::Remote, VecDeque::new());

        Self { config, buffers }
    }

    /// Queue a frame under its origin
    pub fn push(&mut self, frame: AudioFrame) {
        // Validate frame format
        if frame.sample_rate != self.config.sample_rate {
            warn!(
                "Frame sample rate mismatch: expected {}, got {}. Dropping frame.",
                self.config.sample_rate, frame.sample_rate
            );
            return;
        }

        if frame.channels != self.config.channels {
            warn!(
                "Frame channel count mismatch: expected {}, got {}. Dropping frame.",
                self.config.channels, frame.channels
            );
            return;
        }

        let max_samples = self.max_buffered_samples();
        let buffer = self.buffers.entry(frame.origin).or_default();
        buffer.extend(frame.samples.iter().copied());

        // Clean up old samples to prevent unbounded buffering
        if buffer.len() > max_samples {
            let excess = buffer.len() - max_samples;
            buffer.drain(..excess);
            debug!("Dropped {} stale {:?} samples", excess, frame.origin);
        }
    }

    /// Samples currently queued for `origin`
    pub fn buffered(&self, origin: StreamOrigin) -> usize {
        self.buffers.get(&origin).map_or(0, VecDeque::len)
    }

    /// Produce exactly `frames` sample frames (times channels) of mixed audio
    ///
    /// Missing audio on either side is treated as silence, so the output is
    /// silent when neither side has anything queued.
    pub fn mix(&mut self, frames: usize, timestamp_ms: u64) -> AudioFrame {
        let len = frames * self.config.channels as usize;

        let blocks: Vec<Vec<i16>> = self
            .buffers
            .values_mut()
            .map(|buffer| {
                let take = len.min(buffer.len());
                buffer.drain(..take).collect()
            })
            .collect();

        let inputs: Vec<&[i16]> = blocks.iter().map(Vec::as_slice).collect();

        AudioFrame {
            samples: mix_samples(&inputs, len),
            sample_rate: self.config.sample_rate,
            channels: self.config.channels,
            timestamp_ms,
            origin: StreamOrigin::Local,
        }
    }

    fn max_buffered_samples(&self) -> usize {
        (self.config.sample_rate as u64 * self.config.max_buffer_delay_ms / 1000) as usize
            * self.config.channels as usize
    }
}

/// Sum `inputs` sample by sample with clipping, padding short inputs with silence
pub fn mix_samples(inputs: &[&[i16]], len: usize) -> Vec<i16> {
    let mut mixed_samples = Vec::with_capacity(len);

    for i in 0..len {
        let mut sum: i32 = 0;

        for input in inputs {
            sum += input.get(i).copied().unwrap_or(0) as i32;
        }

        // Clip to prevent overflow
        mixed_samples.push(sum.clamp(i16::MIN as i32, i16::MAX as i32) as i16);
    }

    mixed_samples
}
