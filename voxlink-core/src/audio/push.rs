//! Caller-fed audio source.
//!
//! Bytes written through a `PushAudioWriter` are cut into fixed-duration
//! chunks. While no consumer is attached, completed chunks are queued and
//! delivered on the next `turn_on`.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::{AudioFormat, AudioSource, ChunkSink};
use crate::buffering::{AudioChunk, ChunkAssembler};
use crate::error::{Result, VoxlinkError};
use crate::message::new_id;

struct PushState {
    assembler: ChunkAssembler,
    queued: VecDeque<AudioChunk>,
    sink: Option<ChunkSink>,
    closed: bool,
}

impl PushState {
    fn deliver(&mut self, chunk: AudioChunk) {
        let delivered = self
            .sink
            .as_ref()
            .is_some_and(|sink| sink.push(chunk.clone()));
        if !delivered {
            self.sink = None;
            self.queued.push_back(chunk);
        }
    }
}

pub struct PushAudioSource {
    id: String,
    format: AudioFormat,
    state: Arc<Mutex<PushState>>,
}

impl PushAudioSource {
    /// # Errors
    /// `VoxlinkError::AudioStream` if `format` is not whole-byte PCM.
    pub fn new(format: AudioFormat, chunk_duration_ms: u32) -> Result<Self> {
        Ok(Self {
            id: new_id(),
            format,
            state: Arc::new(Mutex::new(PushState {
                assembler: ChunkAssembler::new(format, chunk_duration_ms)?,
                queued: VecDeque::new(),
                sink: None,
                closed: false,
            })),
        })
    }

    /// Writer handle. Any number may exist; they share one stream.
    pub fn writer(&self) -> PushAudioWriter {
        PushAudioWriter {
            state: Arc::clone(&self.state),
        }
    }
}

impl AudioSource for PushAudioSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn turn_on(&self, sink: ChunkSink) -> Result<()> {
        let mut state = self.state.lock();
        while let Some(chunk) = state.queued.pop_front() {
            if !sink.push(chunk) {
                return Err(VoxlinkError::AudioStream("sink went stale during turn on".into()));
            }
        }
        if state.closed {
            debug!(source = self.id.as_str(), "push stream already closed, ending");
            sink.end();
        } else {
            state.sink = Some(sink);
        }
        Ok(())
    }

    fn turn_off(&self) {
        self.state.lock().sink = None;
    }
}

#[derive(Clone)]
pub struct PushAudioWriter {
    state: Arc<Mutex<PushState>>,
}

impl PushAudioWriter {
    /// Append PCM bytes.
    ///
    /// # Errors
    /// `VoxlinkError::InvalidState` after `close()`.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(VoxlinkError::InvalidState("push stream is closed".into()));
        }
        for chunk in state.assembler.push(data) {
            state.deliver(chunk);
        }
        Ok(())
    }

    /// Flush the partial tail and end the stream. Idempotent.
    pub fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        if let Some(tail) = state.assembler.flush() {
            state.deliver(tail);
        }
        if let Some(sink) = state.sink.take() {
            sink.end();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}
