//! Sample-rate conversion between the three rate domains.
//!
//! The engine does arithmetic across the device rate (capture/output),
//! the 16 kHz feature rate (embedder + pitch predictors) and the
//! model-specific target rate. Two conversion primitives cover it:
//!
//! - [`resample`] — pure per-call conversion, used inside the chunk
//!   processor (envelope matching, expected-length bookkeeping).
//! - [`RateConverter`] — a persistent rubato `FastFixedIn` session that
//!   keeps filter history across blocks. The stream scheduler uses one
//!   per leg so chunk seams stay phase-consistent; per-call statelessness
//!   there would click at every block boundary.
//!
//! When source rate == target rate both primitives are passthrough.

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::error;

use crate::buffering::block::AudioBlock;
use crate::error::{Result, RevoiceError};

/// Convert one block from `source_rate` to `target_rate`.
///
/// Pure function of its inputs: no state is carried across calls. The
/// output length is always `round(len × target_rate / source_rate)`, so
/// callers that need an exact device-buffer length only pad or truncate
/// by the rounding residue.
///
/// # Errors
/// `RevoiceError::InvalidRate` when either rate is zero or rubato
/// rejects the ratio. Never silently returns an empty block for
/// non-empty input.
pub fn resample(block: &AudioBlock, source_rate: u32, target_rate: u32) -> Result<AudioBlock> {
    if source_rate == 0 || target_rate == 0 {
        return Err(RevoiceError::InvalidRate(format!(
            "non-positive sample rate: {source_rate} -> {target_rate}"
        )));
    }

    if source_rate == target_rate {
        return Ok(AudioBlock::new(block.samples.clone(), target_rate));
    }

    if block.samples.is_empty() {
        return Ok(AudioBlock::new(Vec::new(), target_rate));
    }

    let ratio = target_rate as f64 / source_rate as f64;
    let expected = (block.samples.len() as f64 * ratio).round() as usize;

    let mut resampler = FastFixedIn::<f32>::new(
        ratio,
        1.0,
        PolynomialDegree::Cubic,
        block.samples.len(),
        1,
    )
    .map_err(|e| RevoiceError::InvalidRate(format!("resampler init: {e}")))?;

    let mut out = resampler
        .process(&[&block.samples], None)
        .map_err(|e| RevoiceError::InvalidRate(format!("resampler process: {e}")))?
        .remove(0);

    // One zero-padded flush recovers the interpolator delay tail.
    if out.len() < expected {
        let flushed = resampler
            .process_partial::<Vec<f32>>(None, None)
            .map_err(|e| RevoiceError::InvalidRate(format!("resampler flush: {e}")))?
            .remove(0);
        out.extend_from_slice(&flushed);
    }

    out.resize(expected, 0.0);
    Ok(AudioBlock::new(out, target_rate))
}

/// Converts f32 mono audio from one fixed sample rate to another while
/// retaining filter history across calls.
pub struct RateConverter {
    /// `None` when source rate == target rate (passthrough mode).
    resampler: Option<FastFixedIn<f32>>,
    /// Input samples waiting for a full rubato chunk.
    pending: Vec<f32>,
    /// Input frames rubato consumes per process call.
    chunk_size: usize,
    /// Pre-allocated mono output buffer sized to `output_frames_max`.
    scratch: Vec<Vec<f32>>,
}

impl RateConverter {
    /// Create a new converter.
    ///
    /// # Parameters
    /// - `source_rate`: Sample rate of the incoming audio (Hz).
    /// - `target_rate`: Sample rate of the produced audio (Hz).
    /// - `chunk_size`: Input frame count per rubato call (e.g. `1024`).
    ///
    /// # Errors
    /// `RevoiceError::InvalidRate` for zero rates or a rejected ratio.
    pub fn new(source_rate: u32, target_rate: u32, chunk_size: usize) -> Result<Self> {
        if source_rate == 0 || target_rate == 0 {
            return Err(RevoiceError::InvalidRate(format!(
                "non-positive sample rate: {source_rate} -> {target_rate}"
            )));
        }

        if source_rate == target_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                scratch: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            target_rate as f64 / source_rate as f64,
            1.0, // ratio never changes mid-stream
            PolynomialDegree::Cubic,
            chunk_size,
            1, // mono
        )
        .map_err(|e| RevoiceError::InvalidRate(format!("resampler init: {e}")))?;

        let scratch = vec![vec![0f32; resampler.output_frames_max()]];
        tracing::debug!(source_rate, target_rate, chunk_size, "rate converter ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            chunk_size,
            scratch,
        })
    }

    /// Process incoming samples, returning resampled output (may be empty).
    ///
    /// Samples are accumulated internally until a full `chunk_size` block
    /// is available for rubato. Any remainder is kept for the next call.
    ///
    /// In passthrough mode (same rates), input is returned directly.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(ref mut resampler) = self.resampler else {
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);

        let mut out = Vec::new();
        while self.pending.len() >= self.chunk_size {
            let chunk = &self.pending[..self.chunk_size];
            match resampler.process_into_buffer(&[chunk], &mut self.scratch, None) {
                Ok((_, produced)) => out.extend_from_slice(&self.scratch[0][..produced]),
                Err(e) => error!(error = %e, "rate conversion failed, dropping chunk"),
            }
            self.pending.drain(..self.chunk_size);
        }
        out
    }

    /// Returns `true` when source rate == target rate (no resampling occurs).
    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_rate_is_identity() {
        let block = AudioBlock::new((0..480).map(|i| i as f32 * 0.001).collect(), 16_000);
        let out = resample(&block, 16_000, 16_000).unwrap();
        assert_eq!(out.samples, block.samples);
        assert_eq!(out.sample_rate, 16_000);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let block = AudioBlock::silence(256, 16_000);
        assert!(matches!(
            resample(&block, 0, 16_000),
            Err(RevoiceError::InvalidRate(_))
        ));
        assert!(matches!(
            resample(&block, 16_000, 0),
            Err(RevoiceError::InvalidRate(_))
        ));
    }

    #[test]
    fn length_is_deterministic() {
        let block = AudioBlock::silence(1024, 16_000);
        let up = resample(&block, 16_000, 48_000).unwrap();
        assert_eq!(up.samples.len(), 3072);
        let down = resample(&block, 16_000, 8_000).unwrap();
        assert_eq!(down.samples.len(), 512);
    }

    #[test]
    fn nonempty_input_never_yields_empty_output() {
        let block = AudioBlock::new(vec![0.5; 64], 48_000);
        let out = resample(&block, 48_000, 16_000).unwrap();
        assert!(!out.samples.is_empty());
        assert!(out.samples.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn converter_passthrough_returns_input_unchanged() {
        let mut rc = RateConverter::new(48_000, 48_000, 1024).unwrap();
        assert!(rc.is_passthrough());
        let samples: Vec<f32> = (0..512).map(|i| (i as f32 * 0.01).sin()).collect();
        assert_eq!(rc.process(&samples), samples);
    }

    #[test]
    fn converter_device_block_yields_feature_rate_length() {
        let mut rc = RateConverter::new(48_000, 16_000, 1024).unwrap();
        assert!(!rc.is_passthrough());
        // 1024 device samples land near 341 feature samples after the
        // first chunk; allow the interpolator a few frames of slack.
        let out = rc.process(&vec![0.0f32; 1024]);
        let diff = (out.len() as isize - 341).unsigned_abs();
        assert!(diff <= 10, "unexpected output length {}", out.len());
    }

    #[test]
    fn converter_holds_partial_chunks_until_full() {
        let mut rc = RateConverter::new(48_000, 16_000, 1024).unwrap();
        assert!(rc.process(&vec![0.0f32; 700]).is_empty());
        // 700 + 700 crosses the 1024 threshold once.
        assert!(!rc.process(&vec![0.0f32; 700]).is_empty());
    }

    /// A persistent converter must not click at block seams; the test
    /// bounds the per-sample step of a converted sine.
    #[test]
    fn converter_blockwise_output_is_continuous() {
        let mut rc = RateConverter::new(48_000, 16_000, 1024).unwrap();

        let mut out = Vec::new();
        for b in 0..16 {
            let block: Vec<f32> = (0..1024)
                .map(|i| {
                    let t = (b * 1024 + i) as f32 / 48_000.0;
                    (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5
                })
                .collect();
            out.extend(rc.process(&block));
        }

        // A 440 Hz half-scale sine at 16 kHz steps at most
        // 2pi*440/16000*0.5, roughly 0.086 per sample.
        let max_step = out
            .windows(2)
            .map(|w| (w[1] - w[0]).abs())
            .fold(0.0f32, f32::max);
        assert!(max_step < 0.2, "seam discontinuity: step={max_step}");
    }

    /// Feeding a signal block-by-block must produce the same samples as
    /// feeding it whole; carried filter history makes the chunking
    /// invisible.
    #[test]
    fn converter_blockwise_matches_full_signal() {
        let signal: Vec<f32> = (0..16_384)
            .map(|i| {
                let t = i as f32 / 48_000.0;
                (2.0 * std::f32::consts::PI * 440.0 * t).sin() * 0.5
            })
            .collect();

        let mut whole = RateConverter::new(48_000, 16_000, signal.len()).unwrap();
        let reference = whole.process(&signal);

        let mut chunked = RateConverter::new(48_000, 16_000, 1024).unwrap();
        let mut blockwise = Vec::new();
        for block in signal.chunks(1024) {
            blockwise.extend(chunked.process(block));
        }

        let overlap = reference.len().min(blockwise.len());
        assert!(
            (reference.len() as isize - blockwise.len() as isize).unsigned_abs() <= 8,
            "lengths diverged: {} vs {}",
            reference.len(),
            blockwise.len()
        );
        for (i, (r, b)) in reference[..overlap]
            .iter()
            .zip(&blockwise[..overlap])
            .enumerate()
        {
            assert!(
                (r - b).abs() < 1e-3,
                "sample {i} diverged: whole={r} blockwise={b}"
            );
        }
    }
}
