//! Audio sources and the multiplexer that fans one source out to many readers.
//!
//! ```text
//! MicrophoneSource ─┐
//! WavFileSource ────┼─► ChunkSink ─► AudioSourceMultiplexer ─┬─► AudioStreamNode (consumer a)
//! PushAudioSource ──┘                                        └─► AudioStreamNode (consumer b)
//! ```
//!
//! Every source produces 16-bit little-endian PCM chunks. A source is turned
//! on when the first consumer attaches and off when the last one detaches.

pub mod capture;
pub mod file;
pub mod multiplexer;
pub mod push;
pub mod resample;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VoxlinkError};

pub use capture::MicrophoneSource;
pub use file::WavFileSource;
pub use multiplexer::{AudioSourceMultiplexer, AudioStreamNode, ChunkSink};
pub use push::{PushAudioSource, PushAudioWriter};

/// PCM layout of a source's chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub bits_per_sample: u16,
    pub channels: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16_mono(16_000)
    }
}

impl AudioFormat {
    pub fn pcm16_mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            bits_per_sample: 16,
            channels: 1,
        }
    }

    /// Check the layout describes whole-byte PCM frames.
    ///
    /// # Errors
    /// `VoxlinkError::AudioStream` for a zero rate, zero channels, or a
    /// sample width that is not a positive multiple of 8 bits.
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0
            || self.channels == 0
            || self.bits_per_sample == 0
            || self.bits_per_sample % 8 != 0
        {
            return Err(VoxlinkError::AudioStream(format!(
                "unsupported audio format: {} Hz, {}-bit, {} channel(s)",
                self.sample_rate, self.bits_per_sample, self.channels
            )));
        }
        Ok(())
    }

    /// Bytes per sample frame (all channels).
    pub fn block_align(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits_per_sample / 8)
    }

    pub fn bytes_per_second(&self) -> u64 {
        u64::from(self.sample_rate) * self.block_align() as u64
    }

    /// Frame-aligned byte count covering `duration_ms`.
    pub fn bytes_for_duration(&self, duration_ms: u32) -> usize {
        let frames = u64::from(self.sample_rate) * u64::from(duration_ms) / 1_000;
        frames as usize * self.block_align()
    }

    pub fn duration_ms(&self, bytes: u64) -> u64 {
        match self.bytes_per_second() {
            0 => 0,
            bps => bytes * 1_000 / bps,
        }
    }
}

/// A physical producer of audio.
///
/// `turn_on` starts delivery into the given sink and returns once the source
/// is confirmed running (or failed to start). `turn_off` must be idempotent.
pub trait AudioSource: Send + Sync {
    fn id(&self) -> &str;

    fn format(&self) -> AudioFormat;

    /// # Errors
    /// `VoxlinkError::AudioDevice` / `VoxlinkError::AudioStream` when the
    /// source cannot start.
    fn turn_on(&self, sink: ChunkSink) -> Result<()>;

    fn turn_off(&self);
}
