//! Fan-out of one `AudioSource` to independent read cursors.
//!
//! The consumer set is a copy-on-write snapshot (`Arc<Vec<..>>`). A broadcast
//! clones the current snapshot under the lock and then sends outside it, so
//! attach/detach never disturbs a broadcast already in flight and a slow
//! reader never blocks the source. Each cursor has its own unbounded queue.
//!
//! Every `turn_on` hands the source a `ChunkSink` stamped with a generation
//! number. Turning the source off bumps the generation, so a sink kept alive
//! by a source thread that has not noticed the stop yet is ignored.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Weak,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{AudioFormat, AudioSource};
use crate::buffering::AudioChunk;
use crate::error::{Result, VoxlinkError};
use crate::message::new_id;
use crate::session::Detachable;

struct Cursor {
    node_id: String,
    consumer_id: String,
    tx: mpsc::UnboundedSender<AudioChunk>,
    detached: Arc<AtomicBool>,
}

#[derive(Default)]
struct FanOut {
    consumers: Arc<Vec<Arc<Cursor>>>,
    generation: u64,
    source_on: bool,
}

struct MuxInner {
    source: Arc<dyn AudioSource>,
    fan_out: Mutex<FanOut>,
}

impl MuxInner {
    /// Remove the cursors matching `pred`, marking their nodes detached.
    /// Returns true when the source should be turned off.
    fn remove_where(&self, pred: impl Fn(&Cursor) -> bool) -> bool {
        let mut fan_out = self.fan_out.lock();
        let before = fan_out.consumers.len();
        let mut remaining = Vec::with_capacity(before);
        for cursor in fan_out.consumers.iter() {
            if pred(cursor) {
                cursor.detached.store(true, Ordering::SeqCst);
            } else {
                remaining.push(Arc::clone(cursor));
            }
        }
        if remaining.len() == before {
            return false;
        }
        fan_out.consumers = Arc::new(remaining);
        if fan_out.consumers.is_empty() && fan_out.source_on {
            fan_out.source_on = false;
            fan_out.generation += 1;
            return true;
        }
        false
    }

    /// Drop every cursor and invalidate the current sink.
    fn clear(&self) -> bool {
        let mut fan_out = self.fan_out.lock();
        fan_out.consumers = Arc::new(Vec::new());
        fan_out.generation += 1;
        std::mem::replace(&mut fan_out.source_on, false)
    }
}

pub struct AudioSourceMultiplexer {
    inner: Arc<MuxInner>,
}

impl AudioSourceMultiplexer {
    pub fn new(source: Arc<dyn AudioSource>) -> Self {
        Self {
            inner: Arc::new(MuxInner {
                source,
                fan_out: Mutex::new(FanOut::default()),
            }),
        }
    }

    pub fn source_id(&self) -> &str {
        self.inner.source.id()
    }

    pub fn format(&self) -> AudioFormat {
        self.inner.source.format()
    }

    pub fn consumer_count(&self) -> usize {
        self.inner.fan_out.lock().consumers.len()
    }

    pub fn is_source_on(&self) -> bool {
        self.inner.fan_out.lock().source_on
    }

    /// Open a cursor starting at the current fan-out position. The first
    /// attach turns the source on.
    ///
    /// # Errors
    /// - `VoxlinkError::InvalidState` if `consumer_id` is already attached.
    /// - Whatever the source's `turn_on` fails with; the cursor is not kept.
    pub fn attach(&self, consumer_id: &str) -> Result<AudioStreamNode> {
        let (tx, rx) = mpsc::unbounded_channel();
        let node_id = new_id();
        let detached = Arc::new(AtomicBool::new(false));
        let start_generation = {
            let mut fan_out = self.inner.fan_out.lock();
            if fan_out.consumers.iter().any(|c| c.consumer_id == consumer_id) {
                return Err(VoxlinkError::InvalidState(format!(
                    "consumer '{consumer_id}' is already attached"
                )));
            }
            let mut next: Vec<_> = fan_out.consumers.iter().cloned().collect();
            next.push(Arc::new(Cursor {
                node_id: node_id.clone(),
                consumer_id: consumer_id.to_string(),
                tx,
                detached: Arc::clone(&detached),
            }));
            fan_out.consumers = Arc::new(next);

            if fan_out.source_on {
                None
            } else {
                fan_out.source_on = true;
                fan_out.generation += 1;
                Some(fan_out.generation)
            }
        };

        if let Some(generation) = start_generation {
            info!(source = self.inner.source.id(), "turning audio source on");
            let sink = ChunkSink {
                mux: Arc::downgrade(&self.inner),
                generation,
            };
            if let Err(e) = self.inner.source.turn_on(sink) {
                warn!(source = self.inner.source.id(), "audio source failed to start: {e}");
                self.inner.clear();
                return Err(e);
            }
        }

        debug!(source = self.inner.source.id(), consumer_id, "audio consumer attached");
        Ok(AudioStreamNode {
            id: node_id,
            consumer_id: consumer_id.to_string(),
            format: self.inner.source.format(),
            rx: tokio::sync::Mutex::new(rx),
            mux: Arc::clone(&self.inner),
            detached,
        })
    }

    /// Remove the cursor currently attached as `consumer_id` and mark its
    /// node detached. The last detach turns the source off.
    pub fn detach(&self, consumer_id: &str) {
        if self.inner.remove_where(|c| c.consumer_id == consumer_id) {
            info!(source = self.inner.source.id(), "last consumer detached, turning source off");
            self.inner.source.turn_off();
        }
    }

    /// Stop the source and end every cursor, attached or not.
    pub fn turn_off(&self) {
        let was_on = self.inner.clear();
        if was_on {
            info!(source = self.inner.source.id(), "audio source turned off");
        }
        self.inner.source.turn_off();
    }
}

impl std::fmt::Debug for AudioSourceMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioSourceMultiplexer")
            .field("source", &self.inner.source.id())
            .field("consumers", &self.consumer_count())
            .finish()
    }
}

/// Handle a running source writes into.
#[derive(Clone)]
pub struct ChunkSink {
    mux: Weak<MuxInner>,
    generation: u64,
}

impl ChunkSink {
    /// Broadcast one chunk to every current consumer.
    ///
    /// Returns `false` once this sink is stale (the source was turned off or
    /// the multiplexer dropped); the source should stop producing.
    pub fn push(&self, chunk: AudioChunk) -> bool {
        let Some(mux) = self.mux.upgrade() else {
            return false;
        };
        let consumers = {
            let fan_out = mux.fan_out.lock();
            if fan_out.generation != self.generation {
                return false;
            }
            Arc::clone(&fan_out.consumers)
        };
        for cursor in consumers.iter() {
            let _ = cursor.tx.send(chunk.clone());
        }
        true
    }

    /// The source ran out of audio. Every cursor ends after its queued chunks.
    pub fn end(&self) {
        let Some(mux) = self.mux.upgrade() else {
            return;
        };
        let mut fan_out = mux.fan_out.lock();
        if fan_out.generation != self.generation {
            return;
        }
        debug!(source = mux.source.id(), "audio source reached end of stream");
        fan_out.consumers = Arc::new(Vec::new());
        fan_out.source_on = false;
        fan_out.generation += 1;
    }

    pub fn is_active(&self) -> bool {
        self.mux
            .upgrade()
            .map(|mux| mux.fan_out.lock().generation == self.generation)
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ChunkSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkSink")
            .field("generation", &self.generation)
            .finish()
    }
}

/// One consumer's read cursor. References the shared source, never owns it.
pub struct AudioStreamNode {
    id: String,
    consumer_id: String,
    format: AudioFormat,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<AudioChunk>>,
    mux: Arc<MuxInner>,
    detached: Arc<AtomicBool>,
}

impl AudioStreamNode {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    /// Next chunk on this cursor, or `None` once the node is detached, the
    /// source ended, or the multiplexer was turned off.
    pub async fn read(&self) -> Option<AudioChunk> {
        if self.is_detached() {
            return None;
        }
        let chunk = self.rx.lock().await.recv().await;
        if self.is_detached() {
            return None;
        }
        chunk
    }

    /// Detach this cursor. Idempotent, and only ever removes this node's own
    /// cursor even if its consumer id has since been reused.
    pub fn detach_now(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(node_id = self.id.as_str(), consumer_id = self.consumer_id.as_str(), "detaching audio node");
        if self.mux.remove_where(|c| c.node_id == self.id) {
            info!(source = self.mux.source.id(), "last consumer detached, turning source off");
            self.mux.source.turn_off();
        }
    }
}

#[async_trait]
impl Detachable for AudioStreamNode {
    fn id(&self) -> &str {
        &self.id
    }

    async fn detach(&self) -> Result<()> {
        self.detach_now();
        Ok(())
    }
}

impl Drop for AudioStreamNode {
    fn drop(&mut self) {
        self.detach_now();
    }
}

impl std::fmt::Debug for AudioStreamNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioStreamNode")
            .field("id", &self.id)
            .field("consumer_id", &self.consumer_id)
            .field("detached", &self.is_detached())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Source driven by the test through the sink it was handed.
    #[derive(Default)]
    struct ManualSource {
        sink: Mutex<Option<ChunkSink>>,
        on_calls: AtomicUsize,
        off_calls: AtomicUsize,
        fail_on: AtomicBool,
    }

    impl ManualSource {
        fn emit(&self, n: u8) -> bool {
            let sink = self.sink.lock().clone();
            sink.map(|s| s.push(AudioChunk::new(vec![n; 4], u64::from(n) * 10)))
                .unwrap_or(false)
        }

        fn end(&self) {
            if let Some(sink) = self.sink.lock().clone() {
                sink.end();
            }
        }
    }

    impl AudioSource for ManualSource {
        fn id(&self) -> &str {
            "manual"
        }

        fn format(&self) -> AudioFormat {
            AudioFormat::default()
        }

        fn turn_on(&self, sink: ChunkSink) -> Result<()> {
            self.on_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.load(Ordering::SeqCst) {
                return Err(VoxlinkError::AudioDevice("no device".into()));
            }
            *self.sink.lock() = Some(sink);
            Ok(())
        }

        fn turn_off(&self) {
            self.off_calls.fetch_add(1, Ordering::SeqCst);
            *self.sink.lock() = None;
        }
    }

    fn mux() -> (AudioSourceMultiplexer, Arc<ManualSource>) {
        let source = Arc::new(ManualSource::default());
        (AudioSourceMultiplexer::new(source.clone()), source)
    }

    #[tokio::test]
    async fn two_consumers_see_identical_chunks_in_order() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach a");
        let b = mux.attach("b").expect("attach b");
        assert_eq!(source.on_calls.load(Ordering::SeqCst), 1);

        for n in 0..5 {
            assert!(source.emit(n));
        }

        for node in [&a, &b] {
            let mut seen = Vec::new();
            for _ in 0..5 {
                seen.push(node.read().await.expect("chunk").data[0]);
            }
            assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        }
    }

    #[tokio::test]
    async fn detaching_one_consumer_does_not_disturb_the_other() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach a");
        let b = mux.attach("b").expect("attach b");

        for n in 0..2 {
            source.emit(n);
        }
        Detachable::detach(&a).await.expect("detach a");
        for n in 2..5 {
            source.emit(n);
        }

        assert!(a.read().await.is_none());
        let mut seen = Vec::new();
        for _ in 0..5 {
            seen.push(b.read().await.expect("chunk").data[0]);
        }
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert_eq!(source.off_calls.load(Ordering::SeqCst), 0);
        assert!(mux.is_source_on());
    }

    #[tokio::test]
    async fn last_detach_turns_the_source_off() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach");
        mux.detach("a");
        assert_eq!(source.off_calls.load(Ordering::SeqCst), 1);
        assert!(!mux.is_source_on());
        assert!(a.read().await.is_none());

        // A late detach through the node is a no-op.
        a.detach_now();
        assert_eq!(source.off_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn late_attach_starts_from_the_current_position() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach a");
        source.emit(0);
        let b = mux.attach("b").expect("attach b");
        source.emit(1);

        assert_eq!(a.read().await.expect("chunk").data[0], 0);
        assert_eq!(b.read().await.expect("chunk").data[0], 1);
    }

    #[tokio::test]
    async fn turn_off_ends_every_cursor_and_stales_the_sink() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach a");
        let stale = source.sink.lock().clone().expect("sink");

        mux.turn_off();
        assert!(a.read().await.is_none());
        assert!(!stale.push(AudioChunk::new(vec![9], 0)));
        assert!(!stale.is_active());
        assert_eq!(mux.consumer_count(), 0);
    }

    #[tokio::test]
    async fn end_of_stream_drains_queued_chunks_first() {
        let (mux, source) = mux();
        let a = mux.attach("a").expect("attach a");
        source.emit(7);
        source.end();

        assert_eq!(a.read().await.expect("queued").data[0], 7);
        assert!(a.read().await.is_none());
    }

    #[tokio::test]
    async fn stale_node_never_removes_a_reattached_consumer() {
        let (mux, source) = mux();
        let old = mux.attach("recognizer").expect("attach");
        mux.detach("recognizer");
        assert!(old.is_detached());

        let fresh = mux.attach("recognizer").expect("reattach");
        let _recorder = mux.attach("recorder").expect("attach recorder");
        drop(old);
        assert_eq!(mux.consumer_count(), 2);
        assert!(!fresh.is_detached());

        assert!(source.emit(3));
        assert_eq!(fresh.read().await.expect("chunk").data[0], 3);
    }

    #[test]
    fn duplicate_consumer_ids_are_rejected() {
        let (mux, _source) = mux();
        let _a = mux.attach("a").expect("attach");
        assert!(matches!(mux.attach("a"), Err(VoxlinkError::InvalidState(_))));
    }

    #[test]
    fn failed_turn_on_keeps_no_cursor() {
        let (mux, source) = mux();
        source.fail_on.store(true, Ordering::SeqCst);
        assert!(matches!(mux.attach("a"), Err(VoxlinkError::AudioDevice(_))));
        assert_eq!(mux.consumer_count(), 0);
        assert!(!mux.is_source_on());
    }
}
