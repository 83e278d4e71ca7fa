//! Salience-based pitch predictors (RMVPE / FCPE exports).
//!
//! Both exports share the same frontend and decoder: a 128-bin log-mel
//! spectrogram in, a per-frame 360-bin cents salience map out. Bin `i`
//! covers `20·i + 1997.38` cents above 10 Hz, i.e. ~32 Hz to ~2 kHz in
//! 20-cent steps.

use std::path::Path;
use std::sync::Arc;

use ort::session::Session;
use ort::value::TensorRef;
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use tracing::info;

use crate::error::{Result, RevoiceError};
use crate::session::backend::PitchPredictor;

const N_FFT: usize = 1024;
const N_FREQS: usize = N_FFT / 2 + 1;
const HOP: usize = 160;
const N_MELS: usize = 128;
const MEL_FMIN: f32 = 30.0;
const MEL_FMAX: f32 = 8_000.0;

const SALIENCE_BINS: usize = 360;
/// Cents above 10 Hz for salience bin 0.
const CENTS_OFFSET: f32 = 1_997.379_4;
const CENTS_PER_BIN: f32 = 20.0;
/// Frames whose peak salience falls below this are unvoiced.
const SALIENCE_THRESHOLD: f32 = 0.03;
/// Bins on each side of the peak included in the weighted average.
const DECODE_WINDOW: usize = 4;

pub struct OnnxPitchPredictor {
    session: Session,
    input_name: String,
    output_name: String,
    /// Triangular filterbank, `N_MELS` rows of `N_FREQS`, flat row-major.
    mel_bank: Vec<f32>,
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
}

impl OnnxPitchPredictor {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = super::create_session(model_path)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| RevoiceError::OnnxSession("pitch graph has no inputs".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| RevoiceError::OnnxSession("pitch graph has no outputs".into()))?;
        info!(path = %model_path.display(), "pitch predictor session ready");

        Ok(Self {
            session,
            input_name,
            output_name,
            mel_bank: mel_bank(N_FFT, crate::config::FEATURE_RATE, N_MELS, MEL_FMIN, MEL_FMAX),
            window: hann_window(N_FFT),
            fft: Arc::from(FftPlanner::<f32>::new().plan_fft_forward(N_FFT)),
        })
    }

    /// Centered STFT log-mel, `[1, N_MELS, frames]` flattened row-major.
    fn log_mel(&self, samples: &[f32]) -> (Vec<f32>, usize) {
        let centered = reflect_pad(samples, N_FFT / 2);
        let frames = 1 + samples.len() / HOP;

        let mut mel = vec![0f32; N_MELS * frames];
        let mut fft_buf = vec![Complex::new(0.0f32, 0.0); N_FFT];

        let mut power = vec![0f32; N_FREQS];
        for frame in 0..frames {
            let start = frame * HOP;
            for (i, v) in fft_buf.iter_mut().enumerate() {
                let s = centered.get(start + i).copied().unwrap_or(0.0);
                *v = Complex::new(s * self.window[i], 0.0);
            }
            self.fft.process(&mut fft_buf);
            for (p, bin) in power.iter_mut().zip(&fft_buf) {
                *p = bin.norm_sqr();
            }

            for (m, row) in self.mel_bank.chunks_exact(N_FREQS).enumerate() {
                let energy: f32 = row.iter().zip(&power).map(|(w, p)| w * p).sum();
                mel[m * frames + frame] = energy.max(1e-5).ln();
            }
        }
        (mel, frames)
    }
}

impl PitchPredictor for OnnxPitchPredictor {
    fn estimate(&mut self, padded: &[f32], frame_count: usize) -> Result<Vec<f32>> {
        let (mel, mel_frames) = self.log_mel(padded);

        let mel_val =
            TensorRef::from_array_view(([1_i64, N_MELS as i64, mel_frames as i64], mel.as_slice()))
                .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => mel_val])
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let (shape, salience) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;

        // [1, frames, 360]
        if shape.len() != 3 || shape[2] as usize != SALIENCE_BINS {
            return Err(RevoiceError::OnnxSession(format!(
                "unexpected salience shape: {shape:?}"
            )));
        }
        let frames = shape[1] as usize;

        let mut f0: Vec<f32> = (0..frames)
            .map(|f| decode_frame(&salience[f * SALIENCE_BINS..(f + 1) * SALIENCE_BINS]))
            .collect();
        // The model's own hop matches the engine window, so the counts
        // differ by at most the centering frame.
        f0.resize(frame_count, 0.0);
        Ok(f0)
    }
}

/// Local weighted average of cents around the salience peak.
fn decode_frame(salience: &[f32]) -> f32 {
    let (peak_idx, peak) = salience
        .iter()
        .copied()
        .enumerate()
        .fold((0usize, f32::MIN), |best, (i, v)| {
            if v > best.1 {
                (i, v)
            } else {
                best
            }
        });
    if peak < SALIENCE_THRESHOLD {
        return 0.0;
    }

    let lo = peak_idx.saturating_sub(DECODE_WINDOW);
    let hi = (peak_idx + DECODE_WINDOW + 1).min(SALIENCE_BINS);
    let mut weighted = 0.0f32;
    let mut total = 0.0f32;
    for i in lo..hi {
        let cents = CENTS_PER_BIN * i as f32 + CENTS_OFFSET;
        weighted += salience[i] * cents;
        total += salience[i];
    }
    if total <= 0.0 {
        return 0.0;
    }
    let cents = weighted / total;
    10.0 * (cents / 1200.0).exp2()
}

fn hann_window(n: usize) -> Vec<f32> {
    use std::f32::consts::PI;
    // 0.5*(1 - cos(2*pi*i/n)) written as sin^2.
    (0..n).map(|i| (PI * i as f32 / n as f32).sin().powi(2)).collect()
}

/// Slaney-style triangular mel filterbank with area normalization,
/// returned flat with rows of `fft_size / 2 + 1` weights.
fn mel_bank(fft_size: usize, sr: u32, n_mels: usize, fmin: f32, fmax: f32) -> Vec<f32> {
    let n_freqs = fft_size / 2 + 1;
    let hz_step = sr as f32 / fft_size as f32;

    // n_mels triangles need n_mels + 2 edge frequencies.
    let (lo, hi) = (hz_to_mel(fmin), hz_to_mel(fmax));
    let edges: Vec<f32> = (0..n_mels + 2)
        .map(|i| mel_to_hz(lo + (hi - lo) * i as f32 / (n_mels + 1) as f32))
        .collect();

    let mut bank = vec![0f32; n_mels * n_freqs];
    for (m, row) in bank.chunks_exact_mut(n_freqs).enumerate() {
        let (left, center, right) = (edges[m], edges[m + 1], edges[m + 2]);
        let enorm = 2.0 / (right - left).max(1e-10);
        for (k, w) in row.iter_mut().enumerate() {
            let freq = k as f32 * hz_step;
            let rise = (freq - left) / (center - left).max(1e-10);
            let fall = (right - freq) / (right - center).max(1e-10);
            *w = rise.min(fall).max(0.0) * enorm;
        }
    }
    bank
}

fn reflect_pad(samples: &[f32], pad: usize) -> Vec<f32> {
    crate::engine::dsp::reflect_pad(samples, pad)
}

// Slaney mel scale: linear below 1 kHz, logarithmic above.
const MEL_F_SP: f32 = 200.0 / 3.0;
const MEL_BREAK_HZ: f32 = 1_000.0;
const MEL_BREAK: f32 = MEL_BREAK_HZ / MEL_F_SP;

fn mel_logstep() -> f32 {
    (6.4_f32).ln() / 27.0
}

fn hz_to_mel(hz: f32) -> f32 {
    if hz >= MEL_BREAK_HZ {
        MEL_BREAK + (hz / MEL_BREAK_HZ).ln() / mel_logstep()
    } else {
        hz / MEL_F_SP
    }
}

fn mel_to_hz(mel: f32) -> f32 {
    if mel >= MEL_BREAK {
        MEL_BREAK_HZ * (mel_logstep() * (mel - MEL_BREAK)).exp()
    } else {
        mel * MEL_F_SP
    }
}
