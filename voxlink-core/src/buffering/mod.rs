//! Sample buffering between capture callbacks and the chunked byte stream.
//!
//! The microphone callback writes f32 samples into a lock-free SPSC ring
//! (`ringbuf::HeapRb<f32>`); a drain thread pops them, resamples, and feeds a
//! `ChunkAssembler` that produces the `AudioChunk`s consumers read.

pub mod chunk;

use ringbuf::{traits::Split, HeapRb};

pub use chunk::{f32_to_pcm16, AudioChunk, ChunkAssembler};
pub use ringbuf::traits::{Consumer, Producer};

/// Producer half, owned by the audio callback.
pub type SampleProducer = ringbuf::HeapProd<f32>;

/// Consumer half, owned by the drain thread.
pub type SampleConsumer = ringbuf::HeapCons<f32>;

/// 2^20 f32 samples, about 21.8 s at 48 kHz.
pub const RING_CAPACITY: usize = 1 << 20;

pub fn create_sample_ring() -> (SampleProducer, SampleConsumer) {
    HeapRb::<f32>::new(RING_CAPACITY).split()
}
