//! Voice-activity gating for the conversion pipeline.
//!
//! The gate runs on feature-rate audio, ahead of the chunk processor.
//! A `Silence` decision skips conversion entirely for that block (the
//! scheduler substitutes a zero block), which avoids burning the block
//! budget on noise and keeps the generator from hallucinating on it.
//!
//! Failure policy: a gate error must never suppress genuine speech, so
//! the scheduler treats a failed `classify` as inactive for that call
//! and converts the block anyway.

pub mod energy;

use crate::buffering::block::AudioBlock;
use crate::error::Result;

/// Whether a given audio block contains speech or silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadDecision {
    /// The block contains speech energy above threshold.
    Speech,
    /// The block is silent (or below threshold, including hangover).
    Silence,
}

impl VadDecision {
    pub fn is_speech(self) -> bool {
        self == VadDecision::Speech
    }
}

/// Trait for all VAD implementations.
///
/// Implementors may be stateful (hangover counters, RNN hidden states).
pub trait VoiceActivityDetector: Send + 'static {
    /// Analyse a block and return a speech/silence decision.
    ///
    /// The block's `sample_rate` should match whatever rate this detector
    /// was configured for. Resampling is the caller's responsibility.
    fn classify(&mut self, block: &AudioBlock) -> Result<VadDecision>;

    /// Reset any internal state (e.g. hangover counters, hidden states).
    fn reset(&mut self);
}
