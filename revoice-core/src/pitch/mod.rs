//! Pitch-track handling: semitone shift, autotune, coarse quantization.
//!
//! Predictors themselves are collaborators (see `session::backend`);
//! this module owns everything done *to* a fine pitch curve once it is
//! estimated, plus the closed set of selectable methods.

use serde::{Deserialize, Serialize};

/// Lowest fine pitch the pipeline tracks (Hz).
pub const F0_MIN: f32 = 50.0;
/// Highest fine pitch the pipeline tracks (Hz).
pub const F0_MAX: f32 = 1100.0;

/// Mel-scale bounds for coarse quantization, `1127·ln(1 + f/700)`.
const F0_MEL_MIN: f32 = 77.754_966;
const F0_MEL_MAX: f32 = 1064.408_2;

/// Selectable pitch-estimation method.
///
/// A closed set: an unrecognised method name maps to [`PitchMethod::Zero`],
/// which produces an all-unvoiced curve instead of failing mid-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PitchMethod {
    /// RMVPE predictor — default, most robust for realtime use.
    #[default]
    Rmvpe,
    /// FCPE predictor — lighter, constructed lazily per call.
    Fcpe,
    /// No estimation: every frame is unvoiced (fine pitch 0, bucket 1).
    Zero,
}

impl PitchMethod {
    /// Parse a method name; anything unrecognised becomes `Zero`.
    pub fn from_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "rmvpe" => Self::Rmvpe,
            "fcpe" => Self::Fcpe,
            _ => Self::Zero,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Rmvpe => "rmvpe",
            Self::Fcpe => "fcpe",
            Self::Zero => "zero",
        }
    }
}

/// Paired fine (Hz) and coarse (integer bucket) pitch sequences, one
/// value per analysis frame of the padded block.
#[derive(Debug, Clone)]
pub struct PitchTrack {
    /// Fine pitch in Hz; 0.0 marks an unvoiced frame.
    pub fine: Vec<f32>,
    /// Mel-quantized buckets in [1, 255]; unvoiced frames map to 1.
    pub coarse: Vec<i64>,
}

impl PitchTrack {
    /// Build a track from a fine curve, deriving the coarse buckets.
    pub fn from_fine(fine: Vec<f32>) -> Self {
        let coarse = quantize_coarse(&fine);
        Self { fine, coarse }
    }

    /// An all-unvoiced track of `frames` length.
    pub fn unvoiced(frames: usize) -> Self {
        Self::from_fine(vec![0.0; frames])
    }

    pub fn len(&self) -> usize {
        self.fine.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fine.is_empty()
    }

    /// Truncate both sequences to at most `frames` entries.
    pub fn truncate(&mut self, frames: usize) {
        self.fine.truncate(frames);
        self.coarse.truncate(frames);
    }
}

/// Shift a fine pitch curve by `semitones` (multiplicative, in place).
pub fn shift_semitones(fine: &mut [f32], semitones: i32) {
    if semitones == 0 {
        return;
    }
    let factor = 2f32.powf(semitones as f32 / 12.0);
    for f in fine.iter_mut() {
        *f *= factor;
    }
}

/// Pull voiced frames toward the nearest equal-tempered note.
///
/// `strength` ∈ [0, 1]: 0 leaves the curve untouched, 1 snaps exactly.
pub fn autotune(fine: &mut [f32], strength: f32) {
    let strength = strength.clamp(0.0, 1.0);
    for f in fine.iter_mut() {
        if *f <= 0.0 {
            continue;
        }
        let semis_from_a4 = 12.0 * (*f / 440.0).log2();
        let target = 440.0 * 2f32.powf(semis_from_a4.round() / 12.0);
        *f += (target - *f) * strength;
    }
}

/// Quantize a fine pitch curve into integer mel buckets.
///
/// Buckets span [1, 255]; values at or below the mel floor (including
/// unvoiced 0 Hz) map to bucket 1, never 0.
pub fn quantize_coarse(fine: &[f32]) -> Vec<i64> {
    fine.iter()
        .map(|&f| {
            let mel = 1127.0 * (1.0 + f / 700.0).ln();
            let scaled = if mel > 0.0 {
                (mel - F0_MEL_MIN) * 254.0 / (F0_MEL_MAX - F0_MEL_MIN) + 1.0
            } else {
                0.0
            };
            scaled.round().clamp(1.0, 255.0) as i64
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn coarse_buckets_stay_in_range() {
        let fine: Vec<f32> = vec![0.0, 1.0, 50.0, 110.0, 440.0, 1100.0, 4000.0, f32::MAX];
        for &bucket in &quantize_coarse(&fine) {
            assert!((1..=255).contains(&bucket), "bucket {bucket} out of range");
        }
    }

    #[test]
    fn zero_pitch_maps_to_bucket_one() {
        let buckets = quantize_coarse(&[0.0, 0.0, 0.0]);
        assert_eq!(buckets, vec![1, 1, 1]);
    }

    #[test]
    fn f0_extremes_hit_bucket_bounds() {
        let buckets = quantize_coarse(&[F0_MIN, F0_MAX]);
        assert_eq!(buckets[0], 1);
        assert_eq!(buckets[1], 255);
    }

    #[test]
    fn shift_up_one_octave_doubles() {
        let mut fine = vec![220.0, 0.0, 440.0];
        shift_semitones(&mut fine, 12);
        assert_relative_eq!(fine[0], 440.0, max_relative = 1e-5);
        assert_eq!(fine[1], 0.0);
        assert_relative_eq!(fine[2], 880.0, max_relative = 1e-5);
    }

    #[test]
    fn autotune_full_strength_snaps_to_note() {
        // 450 Hz sits between A4 (440) and A#4 (466.16); nearest is A4.
        let mut fine = vec![450.0];
        autotune(&mut fine, 1.0);
        assert_relative_eq!(fine[0], 440.0, max_relative = 1e-4);
    }

    #[test]
    fn autotune_partial_strength_moves_partway() {
        let mut fine = vec![450.0];
        autotune(&mut fine, 0.5);
        assert!(fine[0] < 450.0 && fine[0] > 440.0);
    }

    #[test]
    fn autotune_skips_unvoiced() {
        let mut fine = vec![0.0];
        autotune(&mut fine, 1.0);
        assert_eq!(fine[0], 0.0);
    }

    #[test]
    fn unknown_method_name_is_zero() {
        assert_eq!(PitchMethod::from_name("rmvpe"), PitchMethod::Rmvpe);
        assert_eq!(PitchMethod::from_name("FCPE"), PitchMethod::Fcpe);
        assert_eq!(PitchMethod::from_name("crepe"), PitchMethod::Zero);
        assert_eq!(PitchMethod::from_name(""), PitchMethod::Zero);
    }

    #[test]
    fn track_truncates_both_sequences() {
        let mut track = PitchTrack::from_fine(vec![220.0; 10]);
        track.truncate(4);
        assert_eq!(track.fine.len(), 4);
        assert_eq!(track.coarse.len(), 4);
    }
}
