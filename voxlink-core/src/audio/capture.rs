//! Microphone capture via cpal.
//!
//! # Real-time constraints
//!
//! The cpal input callback runs on an OS audio thread at elevated priority.
//! It must not block, perform I/O, or allocate after warm-up. It only
//! down-mixes to mono and writes into the SPSC ring producer, whose
//! `push_slice` is lock-free. Samples the ring has no room for are counted
//! in an atomic and reported from the drain thread.
//!
//! # Threading
//!
//! `cpal::Stream` is `!Send` on most platforms (COM on Windows, CoreAudio on
//! macOS), so each `turn_on` spawns a drain thread that opens the device,
//! owns the stream, and drops it on exit. The thread reports the open result
//! back over a channel before `turn_on` returns.
//!
//! ```text
//! cpal callback ─► ring (f32) ─► drain thread ─► RateConverter ─► PCM16 ─► ChunkAssembler ─► ChunkSink
//! ```

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::resample::{default_block_frames, RateConverter};
use super::{AudioFormat, AudioSource, ChunkSink};
use crate::buffering::{create_sample_ring, f32_to_pcm16, ChunkAssembler, Consumer, SampleProducer};
use crate::config::ServiceConfig;
use crate::error::{Result, VoxlinkError};
use crate::message::new_id;

/// How long `turn_on` waits for the device to open.
const OPEN_TIMEOUT: Duration = Duration::from_secs(5);
/// Drain thread sleep when the ring is empty.
const IDLE_SLEEP: Duration = Duration::from_millis(5);
/// Samples popped from the ring per drain iteration.
const DRAIN_BLOCK: usize = 4_096;

/// Live cpal input stream. Create and drop on the same thread.
struct AudioCapture {
    #[cfg(feature = "audio-cpal")]
    _stream: cpal::Stream,
    sample_rate: u32,
}

impl AudioCapture {
    /// Open the preferred device by name, else the default input, else the
    /// first input device listed.
    #[cfg(feature = "audio-cpal")]
    fn open(
        producer: SampleProducer,
        running: Arc<AtomicBool>,
        dropped: Arc<AtomicU64>,
        preferred_device: Option<&str>,
    ) -> Result<Self> {
        use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
        use cpal::SampleFormat;

        let host = cpal::default_host();
        let preferred = preferred_device.and_then(|wanted| {
            let found = host
                .input_devices()
                .ok()?
                .find(|d| d.name().map(|n| n == wanted).unwrap_or(false));
            if found.is_none() {
                warn!(device = wanted, "preferred input device not found, falling back");
            }
            found
        });

        let device = match preferred.or_else(|| host.default_input_device()) {
            Some(device) => device,
            None => host
                .input_devices()
                .map_err(|e| VoxlinkError::AudioDevice(e.to_string()))?
                .next()
                .ok_or_else(|| VoxlinkError::AudioDevice("no input device available".into()))?,
        };

        let supported = device
            .default_input_config()
            .map_err(|e| VoxlinkError::AudioDevice(e.to_string()))?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        info!(
            device = device.name().unwrap_or_default().as_str(),
            sample_rate,
            channels,
            "opening input device"
        );

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_stream::<f32>(&device, &config, producer, running, dropped),
            SampleFormat::I16 => build_stream::<i16>(&device, &config, producer, running, dropped),
            SampleFormat::U8 => build_stream::<u8>(&device, &config, producer, running, dropped),
            other => {
                return Err(VoxlinkError::AudioStream(format!(
                    "unsupported sample format: {other:?}"
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| VoxlinkError::AudioStream(e.to_string()))?;

        Ok(Self {
            _stream: stream,
            sample_rate,
        })
    }

    #[cfg(not(feature = "audio-cpal"))]
    fn open(
        _producer: SampleProducer,
        _running: Arc<AtomicBool>,
        _dropped: Arc<AtomicU64>,
        _preferred_device: Option<&str>,
    ) -> Result<Self> {
        Err(VoxlinkError::AudioStream(
            "compiled without audio-cpal feature".into(),
        ))
    }
}

/// Input stream for sample type `T`, down-mixed to mono f32.
#[cfg(feature = "audio-cpal")]
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut producer: SampleProducer,
    running: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + Send + 'static,
    f32: cpal::FromSample<T>,
{
    use crate::buffering::Producer;
    use cpal::traits::DeviceTrait;
    use cpal::Sample;

    let channels = usize::from(config.channels.max(1));
    let mut mono: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                if !running.load(Ordering::Relaxed) {
                    return;
                }
                let frames = data.len() / channels;
                mono.resize(frames, 0.0);
                for (frame, out) in data.chunks_exact(channels).zip(mono.iter_mut()) {
                    let sum: f32 = frame.iter().map(|&s| s.to_sample::<f32>()).sum();
                    *out = sum / channels as f32;
                }
                let written = producer.push_slice(&mono);
                if written < mono.len() {
                    dropped.fetch_add((mono.len() - written) as u64, Ordering::Relaxed);
                }
            },
            |err| tracing::error!("audio stream error: {err}"),
            None,
        )
        .map_err(|e| VoxlinkError::AudioStream(e.to_string()))
}

/// Default (or named) microphone as an audio source.
pub struct MicrophoneSource {
    id: String,
    preferred_device: Option<String>,
    format: AudioFormat,
    chunk_duration_ms: u32,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl MicrophoneSource {
    pub fn new(target_sample_rate: u32, chunk_duration_ms: u32) -> Self {
        Self {
            id: new_id(),
            preferred_device: None,
            format: AudioFormat::pcm16_mono(target_sample_rate),
            chunk_duration_ms,
            running: Mutex::new(None),
        }
    }

    /// Rate and chunking taken from the service configuration.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.target_sample_rate, config.chunk_duration_ms)
    }

    /// Prefer an input device by its OS name.
    pub fn with_device(mut self, name: impl Into<String>) -> Self {
        self.preferred_device = Some(name.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| r.load(Ordering::SeqCst))
    }
}

impl AudioSource for MicrophoneSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    /// Blocks until the device is confirmed open or fails.
    fn turn_on(&self, sink: ChunkSink) -> Result<()> {
        let running = Arc::new(AtomicBool::new(true));
        if let Some(previous) = self.running.lock().replace(Arc::clone(&running)) {
            previous.store(false, Ordering::SeqCst);
        }

        let (open_tx, open_rx) = crossbeam_channel::bounded::<Result<u32>>(1);
        let drain = DrainContext {
            source_id: self.id.clone(),
            preferred_device: self.preferred_device.clone(),
            format: self.format,
            chunk_duration_ms: self.chunk_duration_ms,
            running: Arc::clone(&running),
            sink,
        };

        thread::Builder::new()
            .name("voxlink-mic".into())
            .spawn(move || drain.run(open_tx))
            .map_err(VoxlinkError::Io)?;

        let opened = match open_rx.recv_timeout(OPEN_TIMEOUT) {
            Ok(result) => result,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Err(VoxlinkError::AudioDevice(
                "timed out opening the input device".into(),
            )),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(VoxlinkError::Other(
                anyhow::anyhow!("capture thread died before opening the device"),
            )),
        };

        match opened {
            Ok(capture_rate) => {
                info!(source = self.id.as_str(), capture_rate, "microphone capture started");
                Ok(())
            }
            Err(e) => {
                running.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn turn_off(&self) {
        if let Some(running) = self.running.lock().take() {
            running.store(false, Ordering::SeqCst);
            info!(source = self.id.as_str(), "microphone capture stop requested");
        }
    }
}

struct DrainContext {
    source_id: String,
    preferred_device: Option<String>,
    format: AudioFormat,
    chunk_duration_ms: u32,
    running: Arc<AtomicBool>,
    sink: ChunkSink,
}

impl DrainContext {
    fn run(self, open_tx: crossbeam_channel::Sender<Result<u32>>) {
        let (producer, mut consumer) = create_sample_ring();
        let dropped = Arc::new(AtomicU64::new(0));

        // Must be opened on this thread; the stream is dropped when it returns.
        let capture = match AudioCapture::open(
            producer,
            Arc::clone(&self.running),
            Arc::clone(&dropped),
            self.preferred_device.as_deref(),
        ) {
            Ok(capture) => capture,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };

        let capture_rate = capture.sample_rate;
        let mut converter = match RateConverter::new(
            capture_rate,
            self.format.sample_rate,
            default_block_frames(capture_rate),
        ) {
            Ok(converter) => converter,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let mut assembler = match ChunkAssembler::new(self.format, self.chunk_duration_ms) {
            Ok(assembler) => assembler,
            Err(e) => {
                let _ = open_tx.send(Err(e));
                return;
            }
        };
        let _ = open_tx.send(Ok(capture_rate));

        let mut raw = vec![0f32; DRAIN_BLOCK];
        let mut pcm = BytesMut::new();

        while self.running.load(Ordering::SeqCst) {
            report_dropped(&dropped, &self.source_id);
            let popped = consumer.pop_slice(&mut raw);
            if popped == 0 {
                thread::sleep(IDLE_SLEEP);
                continue;
            }

            pcm.clear();
            f32_to_pcm16(&converter.process(&raw[..popped]), &mut pcm);
            for chunk in assembler.push(&pcm) {
                if !self.sink.push(chunk) {
                    debug!(source = self.source_id.as_str(), "sink went stale, stopping capture");
                    self.running.store(false, Ordering::SeqCst);
                    break;
                }
            }
        }

        drop(capture);
        report_dropped(&dropped, &self.source_id);
        debug!(source = self.source_id.as_str(), "microphone drain thread exited");
    }
}

/// Log and reset the callback's overflow counter. Returns what was dropped.
fn report_dropped(dropped: &AtomicU64, source_id: &str) -> u64 {
    let samples = dropped.swap(0, Ordering::Relaxed);
    if samples > 0 {
        warn!(source = source_id, samples, "capture ring full, samples dropped");
    }
    samples
}
