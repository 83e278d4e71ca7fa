//! Energy-based VAD using RMS threshold + hangover counter.
//!
//! ## Algorithm
//!
//! 1. Compute RMS of the incoming block.
//! 2. If RMS ≥ `threshold` → `Speech`, reset hangover counter.
//! 3. If RMS < `threshold` and hangover counter > 0 → `Speech`,
//!    decrement counter (prevents clipping syllable endings).
//! 4. Otherwise → `Silence`.

use super::{VadDecision, VoiceActivityDetector};
use crate::buffering::block::AudioBlock;
use crate::error::Result;

/// RMS thresholds indexed by sensitivity mode 0–3.
/// Mode 3 is the most aggressive gate (more blocks classified silent).
const SENSITIVITY_THRESHOLDS: [f32; 4] = [0.003, 0.008, 0.015, 0.03];

/// A simple energy-based voice activity detector.
#[derive(Debug, Clone)]
pub struct EnergyVad {
    /// RMS amplitude threshold. Blocks above this are considered speech.
    threshold: f32,
    /// How many consecutive below-threshold blocks to still emit `Speech`
    /// after real speech ends.
    hangover_blocks: u32,
    /// Current hangover countdown.
    hangover_counter: u32,
}

impl EnergyVad {
    /// Create a new `EnergyVad`.
    ///
    /// # Parameters
    /// - `threshold`: RMS level above which a block is considered speech.
    /// - `hangover_blocks`: Number of silent blocks that extend speech
    ///   detection. At a 21 ms block, `8` ≈ 170 ms.
    pub fn new(threshold: f32, hangover_blocks: u32) -> Self {
        Self {
            threshold,
            hangover_counter: 0,
            hangover_blocks,
        }
    }

    /// Construct from a sensitivity mode in [0, 3]; values above 3 clamp.
    pub fn from_sensitivity(mode: u8) -> Self {
        let idx = (mode as usize).min(SENSITIVITY_THRESHOLDS.len() - 1);
        Self::new(SENSITIVITY_THRESHOLDS[idx], 8)
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::from_sensitivity(3)
    }
}

impl VoiceActivityDetector for EnergyVad {
    fn classify(&mut self, block: &AudioBlock) -> Result<VadDecision> {
        let rms = block.rms();

        let decision = if rms >= self.threshold {
            self.hangover_counter = self.hangover_blocks;
            VadDecision::Speech
        } else if self.hangover_counter > 0 {
            self.hangover_counter -= 1;
            VadDecision::Speech
        } else {
            VadDecision::Silence
        };

        Ok(decision)
    }

    fn reset(&mut self) {
        self.hangover_counter = 0;
    }
}
