//! Audio chunks handed to the multiplexer, and the assembler that cuts a PCM
//! byte stream into them.

use bytes::{BufMut, Bytes, BytesMut};

use crate::audio::AudioFormat;
use crate::error::Result;

/// An immutable block of PCM bytes plus its position in the source stream.
///
/// Cloning is cheap (`Bytes` is reference counted), so the same chunk can be
/// broadcast to every consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub data: Bytes,
    /// Milliseconds of audio that preceded this chunk in its source.
    pub offset_ms: u64,
}

impl AudioChunk {
    pub fn new(data: impl Into<Bytes>, offset_ms: u64) -> Self {
        Self {
            data: data.into(),
            offset_ms,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Duration of this chunk at `format`.
    pub fn duration_ms(&self, format: &AudioFormat) -> u64 {
        format.duration_ms(self.data.len() as u64)
    }
}

/// Slices an arbitrary byte stream into fixed-size, frame-aligned chunks.
#[derive(Debug)]
pub struct ChunkAssembler {
    format: AudioFormat,
    chunk_bytes: usize,
    pending: BytesMut,
    emitted_bytes: u64,
}

impl ChunkAssembler {
    /// # Errors
    /// `VoxlinkError::AudioStream` if `format` fails `AudioFormat::validate`.
    pub fn new(format: AudioFormat, chunk_duration_ms: u32) -> Result<Self> {
        format.validate()?;
        let chunk_bytes = format.bytes_for_duration(chunk_duration_ms).max(format.block_align());
        Ok(Self {
            format,
            chunk_bytes,
            pending: BytesMut::with_capacity(chunk_bytes),
            emitted_bytes: 0,
        })
    }

    pub fn chunk_bytes(&self) -> usize {
        self.chunk_bytes
    }

    /// Append bytes and return every chunk that is now complete.
    pub fn push(&mut self, data: &[u8]) -> Vec<AudioChunk> {
        self.pending.extend_from_slice(data);
        let mut ready = Vec::with_capacity(self.pending.len() / self.chunk_bytes);
        while self.pending.len() >= self.chunk_bytes {
            let block = self.pending.split_to(self.chunk_bytes).freeze();
            ready.push(self.emit(block));
        }
        ready
    }

    /// Emit whatever is buffered as a final short chunk.
    pub fn flush(&mut self) -> Option<AudioChunk> {
        if self.pending.is_empty() {
            return None;
        }
        let block = self.pending.split().freeze();
        Some(self.emit(block))
    }

    fn emit(&mut self, block: Bytes) -> AudioChunk {
        let offset_ms = self.format.duration_ms(self.emitted_bytes);
        self.emitted_bytes += block.len() as u64;
        AudioChunk::new(block, offset_ms)
    }
}

/// Append mono f32 samples in `[-1.0, 1.0]` as little-endian 16-bit PCM.
pub fn f32_to_pcm16(samples: &[f32], out: &mut BytesMut) {
    out.reserve(samples.len() * 2);
    for &sample in samples {
        let scaled = (sample.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        out.put_i16_le(scaled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembler_emits_fixed_size_chunks_with_offsets() {
        // 16 kHz mono PCM16: 10 ms = 320 bytes.
        let mut assembler = ChunkAssembler::new(AudioFormat::default(), 10).expect("assembler");
        assert_eq!(assembler.chunk_bytes(), 320);

        assert!(assembler.push(&[0u8; 200]).is_empty());
        let chunks = assembler.push(&[0u8; 500]);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].offset_ms, 0);
        assert_eq!(chunks[1].offset_ms, 10);

        let tail = assembler.flush().expect("remainder");
        assert_eq!(tail.len(), 60);
        assert_eq!(tail.offset_ms, 20);
        assert!(assembler.flush().is_none());
    }

    #[test]
    fn sub_byte_sample_width_is_rejected() {
        let nibbles = AudioFormat {
            sample_rate: 16_000,
            bits_per_sample: 4,
            channels: 1,
        };
        assert!(matches!(
            ChunkAssembler::new(nibbles, 100),
            Err(crate::error::VoxlinkError::AudioStream(_))
        ));
    }

    #[test]
    fn pcm16_conversion_clamps_and_is_little_endian() {
        let mut out = BytesMut::new();
        f32_to_pcm16(&[0.0, 1.0, -2.0], &mut out);
        assert_eq!(&out[..2], &[0, 0]);
        assert_eq!(i16::from_le_bytes([out[2], out[3]]), i16::MAX);
        assert_eq!(i16::from_le_bytes([out[4], out[5]]), -i16::MAX);
    }
}
