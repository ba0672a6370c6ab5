//! WAV file playback as an audio source.
//!
//! Only 16-bit integer PCM is accepted so chunks can be forwarded without
//! conversion. The file is read on a dedicated thread as fast as consumers
//! accept it; there is no real-time pacing.

use std::path::{Path, PathBuf};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread;

use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::{AudioFormat, AudioSource, ChunkSink};
use crate::buffering::ChunkAssembler;
use crate::error::{Result, VoxlinkError};
use crate::message::new_id;

/// Samples decoded per read before handing them to the assembler.
const READ_BLOCK_SAMPLES: usize = 4_096;

pub struct WavFileSource {
    id: String,
    path: PathBuf,
    format: AudioFormat,
    chunk_duration_ms: u32,
    /// Stop flag of the playback thread currently running, if any.
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl WavFileSource {
    /// Inspect the header and build the source.
    ///
    /// # Errors
    /// `VoxlinkError::AudioStream` if the file cannot be opened or is not
    /// 16-bit integer PCM.
    pub fn open(path: impl AsRef<Path>, chunk_duration_ms: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let reader = hound::WavReader::open(&path)
            .map_err(|e| VoxlinkError::AudioStream(format!("{}: {e}", path.display())))?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(VoxlinkError::AudioStream(format!(
                "{}: only 16-bit PCM is supported (got {:?} {}-bit)",
                path.display(),
                spec.sample_format,
                spec.bits_per_sample
            )));
        }

        let format = AudioFormat {
            sample_rate: spec.sample_rate,
            bits_per_sample: spec.bits_per_sample,
            channels: spec.channels,
        };
        format.validate()?;

        Ok(Self {
            id: new_id(),
            path,
            format,
            chunk_duration_ms,
            running: Mutex::new(None),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for WavFileSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn format(&self) -> AudioFormat {
        self.format
    }

    fn turn_on(&self, sink: ChunkSink) -> Result<()> {
        let reader = hound::WavReader::open(&self.path)
            .map_err(|e| VoxlinkError::AudioStream(format!("{}: {e}", self.path.display())))?;

        let assembler = ChunkAssembler::new(self.format, self.chunk_duration_ms)?;
        let running = Arc::new(AtomicBool::new(true));
        if let Some(previous) = self.running.lock().replace(Arc::clone(&running)) {
            previous.store(false, Ordering::SeqCst);
        }

        let source_id = self.id.clone();
        info!(source = source_id.as_str(), path = %self.path.display(), "starting wav playback");

        thread::Builder::new()
            .name("voxlink-wav".into())
            .spawn(move || play(reader, assembler, sink, running, source_id))
            .map_err(VoxlinkError::Io)?;
        Ok(())
    }

    fn turn_off(&self) {
        if let Some(running) = self.running.lock().take() {
            running.store(false, Ordering::SeqCst);
        }
    }
}

fn play(
    mut reader: hound::WavReader<std::io::BufReader<std::fs::File>>,
    mut assembler: ChunkAssembler,
    sink: ChunkSink,
    running: Arc<AtomicBool>,
    source_id: String,
) {
    let mut block = BytesMut::with_capacity(READ_BLOCK_SAMPLES * 2);
    let mut samples = reader.samples::<i16>();

    loop {
        if !running.load(Ordering::SeqCst) {
            debug!(source = source_id.as_str(), "wav playback stopped");
            return;
        }

        block.clear();
        let mut failed = false;
        for sample in samples.by_ref().take(READ_BLOCK_SAMPLES) {
            match sample {
                Ok(s) => block.put_i16_le(s),
                Err(e) => {
                    warn!(source = source_id.as_str(), "wav decode error, ending stream: {e}");
                    failed = true;
                    break;
                }
            }
        }

        let exhausted = failed || block.len() < READ_BLOCK_SAMPLES * 2;
        for chunk in assembler.push(&block) {
            if !sink.push(chunk) {
                return;
            }
        }

        if exhausted {
            if let Some(tail) = assembler.flush() {
                if !sink.push(tail) {
                    return;
                }
            }
            info!(source = source_id.as_str(), "wav playback finished");
            sink.end();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::AudioSourceMultiplexer;

    fn write_wav(path: &Path, spec: hound::WavSpec, samples: usize) {
        let mut writer = hound::WavWriter::create(path, spec).expect("create wav");
        for i in 0..samples {
            writer.write_sample((i % 100) as i16).expect("write sample");
        }
        writer.finalize().expect("finalize wav");
    }

    fn pcm16(sample_rate: u32) -> hound::WavSpec {
        hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }

    #[tokio::test]
    async fn plays_whole_file_in_fixed_chunks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("speech.wav");
        // 250 ms at 16 kHz.
        write_wav(&path, pcm16(16_000), 4_000);

        let source = Arc::new(WavFileSource::open(&path, 100).expect("open"));
        assert_eq!(source.format(), AudioFormat::default());

        let mux = AudioSourceMultiplexer::new(source.clone());
        let node = mux.attach("reader").expect("attach");

        let mut sizes = Vec::new();
        let mut offsets = Vec::new();
        while let Some(chunk) = node.read().await {
            sizes.push(chunk.len());
            offsets.push(chunk.offset_ms);
        }
        assert_eq!(sizes, vec![3_200, 3_200, 1_600]);
        assert_eq!(offsets, vec![0, 100, 200]);
    }

    #[test]
    fn non_pcm16_files_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("float.wav");
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16_000,
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
        };
        let mut writer = hound::WavWriter::create(&path, spec).expect("create wav");
        writer.write_sample(0.25f32).expect("write");
        writer.finalize().expect("finalize");

        assert!(matches!(
            WavFileSource::open(&path, 100),
            Err(VoxlinkError::AudioStream(_))
        ));
    }

    #[test]
    fn missing_file_is_an_audio_stream_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(matches!(
            WavFileSource::open(dir.path().join("absent.wav"), 100),
            Err(VoxlinkError::AudioStream(_))
        ));
    }
}
