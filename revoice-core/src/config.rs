//! Engine configuration snapshots.
//!
//! `ConversionSettings` is copied into the worker at stream start and is
//! read-only for the lifetime of that stream — knob changes apply on the
//! next start/stop cycle, never mid-stream.

use serde::{Deserialize, Serialize};

use crate::pitch::PitchMethod;

/// Fixed sample rate of the embedder / pitch-predictor front end (Hz).
pub const FEATURE_RATE: u32 = 16_000;

/// Analysis window of the feature front end, in samples at `FEATURE_RATE`.
/// One feature frame covers 10 ms.
pub const WINDOW: usize = 160;

/// Reflect-pad context added on each side of a block before feature and
/// pitch extraction, in seconds. The offline pipeline pads by a full
/// second; for 20–60 ms realtime blocks that would dominate the chunk,
/// so the realtime engine uses a tenth of it.
pub const CONTEXT_SECS: f32 = 0.1;

/// Per-stream conversion knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversionSettings {
    /// Pitch shift in semitones, clamped to ±24.
    pub pitch_shift: i32,
    /// Retrieval blend rate in [0, 1]. 0 disables blending.
    pub index_rate: f32,
    /// Voiceless-consonant protection strength in [0, 0.5].
    /// 0.5 disables protection.
    pub protect: f32,
    /// Which pitch predictor to run.
    pub pitch_method: PitchMethod,
    /// Pull the pitch curve toward the nearest equal-tempered note.
    pub autotune: bool,
    /// Autotune pull strength in [0, 1].
    pub autotune_strength: f32,
    /// Output volume-envelope mix in [0, 1]:
    /// 0 = fully the input's envelope, 1 = fully the converted envelope.
    pub envelope_mix: f32,
    /// Gate non-speech blocks before conversion.
    pub vad_enabled: bool,
    /// VAD sensitivity mode in [0, 3]; 3 is most aggressive.
    pub vad_sensitivity: u8,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            pitch_shift: 0,
            index_rate: 0.75,
            protect: 0.33,
            pitch_method: PitchMethod::Rmvpe,
            autotune: false,
            autotune_strength: 0.8,
            envelope_mix: 1.0,
            vad_enabled: true,
            vad_sensitivity: 3,
        }
    }
}

impl ConversionSettings {
    /// Clamp every knob into its documented range.
    pub fn clamped(mut self) -> Self {
        self.pitch_shift = self.pitch_shift.clamp(-24, 24);
        self.index_rate = self.index_rate.clamp(0.0, 1.0);
        self.protect = self.protect.clamp(0.0, 0.5);
        self.autotune_strength = self.autotune_strength.clamp(0.0, 1.0);
        self.envelope_mix = self.envelope_mix.clamp(0.0, 1.0);
        self.vad_sensitivity = self.vad_sensitivity.min(3);
        self
    }
}

/// Duplex transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamConfig {
    /// Input device name; `None` selects the system default microphone.
    pub input_device: Option<String>,
    /// Output device name; `None` selects the system default output.
    pub output_device: Option<String>,
    /// Device sample rate for both legs (Hz).
    pub sample_rate: u32,
    /// Samples per hardware callback. One block is the hard deadline unit.
    pub block_size: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            input_device: None,
            output_device: None,
            sample_rate: 48_000,
            block_size: 1024,
        }
    }
}

impl StreamConfig {
    /// Duration of one block — the hardware deadline for the full pipeline.
    pub fn block_duration_secs(&self) -> f64 {
        self.block_size as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_in_range() {
        let s = ConversionSettings::default();
        let c = s.clone().clamped();
        assert_eq!(s.pitch_shift, c.pitch_shift);
        assert_eq!(s.index_rate, c.index_rate);
        assert_eq!(s.protect, c.protect);
    }

    #[test]
    fn clamped_limits_out_of_range_values() {
        let s = ConversionSettings {
            pitch_shift: 60,
            index_rate: 1.7,
            protect: 0.9,
            autotune_strength: -1.0,
            envelope_mix: 2.0,
            vad_sensitivity: 9,
            ..Default::default()
        }
        .clamped();
        assert_eq!(s.pitch_shift, 24);
        assert_eq!(s.index_rate, 1.0);
        assert_eq!(s.protect, 0.5);
        assert_eq!(s.autotune_strength, 0.0);
        assert_eq!(s.envelope_mix, 1.0);
        assert_eq!(s.vad_sensitivity, 3);
    }

    #[test]
    fn block_duration_at_48k() {
        let cfg = StreamConfig::default();
        let dur = cfg.block_duration_secs();
        assert!((dur - 1024.0 / 48_000.0).abs() < 1e-12);
    }

    #[test]
    fn settings_serialize_camel_case() {
        let json = serde_json::to_value(ConversionSettings::default()).unwrap();
        assert_eq!(json["pitchShift"], 0);
        assert_eq!(json["pitchMethod"], "rmvpe");
        assert_eq!(json["vadEnabled"], true);
    }
}
