//! Capture-rate to service-rate conversion with a rubato `FastFixedIn`.
//!
//! Microphones usually run at 44.1 or 48 kHz while the service expects the
//! configured target rate (16 kHz by default). `RateConverter` runs on the
//! microphone drain thread, where allocation is allowed. Equal rates skip
//! rubato entirely.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{error, info};

use crate::error::{Result, VoxlinkError};

/// Input frames per rubato call at `capture_rate`: 20 ms worth.
pub fn default_block_frames(capture_rate: u32) -> usize {
    (capture_rate as usize / 50).max(1)
}

pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    block_frames: usize,
    output: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `VoxlinkError::AudioStream` if rubato rejects the ratio or block size.
    pub fn new(capture_rate: u32, target_rate: u32, block_frames: usize) -> Result<Self> {
        if capture_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                block_frames,
                output: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            f64::from(target_rate) / f64::from(capture_rate),
            1.0,
            PolynomialDegree::Cubic,
            block_frames,
            1,
        )
        .map_err(|e| VoxlinkError::AudioStream(format!("resampler init: {e}")))?;

        let output = vec![vec![0f32; resampler.output_frames_max()]; 1];
        info!(capture_rate, target_rate, block_frames, "resampling capture audio");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            block_frames,
            output,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed mono samples; returns whatever output full blocks produced.
    /// A partial block stays buffered until the next call.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut converted = Vec::new();
        let mut consumed = 0;

        while self.pending.len() - consumed >= self.block_frames {
            let block = &self.pending[consumed..consumed + self.block_frames];
            match resampler.process_into_buffer(&[block], &mut self.output, None) {
                Ok((_, produced)) => converted.extend_from_slice(&self.output[0][..produced]),
                Err(e) => error!("resampler block dropped: {e}"),
            }
            consumed += self.block_frames;
        }
        self.pending.drain(..consumed);
        converted
    }
}
