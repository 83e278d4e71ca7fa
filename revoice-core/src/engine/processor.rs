//! Chunk processor: one block of feature-rate audio in, one block of
//! target-rate audio out.
//!
//! Every input a collaborator needs travels through [`SessionSnapshot`]
//! and [`ConversionSettings`] arguments; the processor itself holds no
//! model state, so a session swap between blocks is invisible to it.
//!
//! Any error inside a block yields silence of the exact length the
//! block would have produced, so downstream pacing never skews.

use tracing::{error, trace};

use crate::config::ConversionSettings;
use crate::error::{Result, RevoiceError};
use crate::pitch::{PitchMethod, PitchTrack};
use crate::session::features::FeatureTensor;
use crate::session::retrieval::nearest_neighbor_blend;
use crate::session::SessionSnapshot;

use super::dsp;

pub struct ChunkProcessor;

impl ChunkProcessor {
    pub fn new() -> Self {
        Self
    }

    /// Convert one feature-rate block. Never fails: processing errors
    /// are logged and replaced by silence of the expected length.
    pub fn process(
        &mut self,
        snapshot: &SessionSnapshot,
        settings: &ConversionSettings,
        input: &[f32],
    ) -> Vec<f32> {
        let expected = self.output_len(snapshot, input.len());
        match self.process_inner(snapshot, settings, input) {
            Ok(mut out) => {
                // Hold the length contract even if a collaborator
                // produced an off-by-a-few tail.
                out.resize(expected, 0.0);
                out
            }
            Err(err) => {
                error!(%err, "chunk processing failed, emitting silence");
                vec![0.0; expected]
            }
        }
    }

    /// Target-rate sample count a block of `input_len` feature-rate
    /// samples converts to.
    pub fn output_len(&self, snapshot: &SessionSnapshot, input_len: usize) -> usize {
        let c = snapshot.constants;
        dsp::expected_output_len(input_len, c.feature_rate, c.target_rate).unwrap_or(0)
    }

    fn process_inner(
        &mut self,
        snapshot: &SessionSnapshot,
        settings: &ConversionSettings,
        input: &[f32],
    ) -> Result<Vec<f32>> {
        if input.is_empty() {
            return Ok(Vec::new());
        }
        let c = snapshot.constants;

        // 1. High-pass to strip DC and rumble before pitch analysis.
        let filtered = dsp::highpass_filtfilt(input);

        // 2. Reflect-pad so analysis windows at the block edges see
        //    plausible context instead of discontinuities.
        let padded = dsp::reflect_pad(&filtered, c.t_pad);
        let p_len = padded.len() / c.window;

        // 3. Pitch track, present only for f0-conditioned generators.
        let pitch = if snapshot.info.uses_pitch {
            Some(self.pitch_track(snapshot, settings, &padded, p_len)?)
        } else {
            None
        };

        // 4. Content embedding over the padded block.
        let features = snapshot.embedder.lock().extract(&padded)?;
        if features.frames() == 0 {
            return Err(RevoiceError::Processing(
                "embedder produced no frames".into(),
            ));
        }

        // 5. Retrieval blend pulls embeddings towards the target
        //    speaker's feature bank. Keep the pre-blend copy for the
        //    voiceless protection mix below.
        let pre_blend = features.clone();
        let blended = match &snapshot.index {
            Some(index) => nearest_neighbor_blend(&features, index, settings.index_rate)?,
            None => features,
        };

        // 6. Embedder frames cover two windows each; duplicate to the
        //    generator's one-frame-per-window grid.
        let mut feats = blended.upsampled_2x();
        let feats0 = pre_blend.upsampled_2x();

        // 7. Align feature frames, pitch frames and p_len by truncating
        //    whichever ran longer.
        let frame_len = match &pitch {
            Some(p) => p_len.min(feats.frames()).min(p.len()),
            None => p_len.min(feats.frames()),
        };
        feats.truncate_frames(frame_len);
        let mut pitch = pitch;
        if let Some(p) = pitch.as_mut() {
            p.truncate(frame_len);
        }

        // 8. Voiceless protection: on unvoiced frames, fade back towards
        //    the unblended embedding to keep consonants crisp.
        if settings.protect < 0.5 {
            if let Some(p) = &pitch {
                apply_protection(&mut feats, &feats0, p, settings.protect);
            }
        }

        // 9. Synthesis at the generator's native rate.
        let raw = snapshot.generator.lock().synthesize(
            &feats,
            frame_len,
            pitch.as_ref(),
            snapshot.speaker_id,
        )?;

        // 10. Trim the synthesized padding back off.
        let expected = dsp::expected_output_len(input.len(), c.feature_rate, c.target_rate)?;
        let mut out = trim_padding(raw, c.t_pad_tgt, expected);

        // 11. Envelope transfer from the original (pre-filter) input.
        dsp::match_envelope(
            input,
            c.feature_rate,
            &mut out,
            c.target_rate,
            settings.envelope_mix,
        );

        // 12. Hard peak ceiling.
        dsp::limit_peak(&mut out);

        trace!(
            input_len = input.len(),
            frames = frame_len,
            out_len = out.len(),
            "chunk converted"
        );
        Ok(out)
    }

    fn pitch_track(
        &mut self,
        snapshot: &SessionSnapshot,
        settings: &ConversionSettings,
        padded: &[f32],
        p_len: usize,
    ) -> Result<PitchTrack> {
        // Zero is an explicit "no pitch conditioning" choice, not a
        // fallback for a missing predictor.
        if settings.pitch_method == PitchMethod::Zero {
            return Ok(PitchTrack::unvoiced(p_len));
        }

        let predictor = snapshot.predictor_for(settings.pitch_method)?;
        let mut fine = predictor.lock().estimate(padded, p_len)?;
        fine.resize(p_len, 0.0);

        crate::pitch::shift_semitones(&mut fine, settings.pitch_shift);
        if settings.autotune {
            crate::pitch::autotune(&mut fine, settings.autotune_strength);
        }
        Ok(PitchTrack::from_fine(fine))
    }
}

impl Default for ChunkProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-frame blend of pitched and unpitched embeddings: voiced frames
/// keep the blended features, unvoiced frames mix back `1 - protect`
/// of the originals.
fn apply_protection(
    feats: &mut FeatureTensor,
    feats0: &FeatureTensor,
    pitch: &PitchTrack,
    protect: f32,
) {
    let frames = feats.frames().min(feats0.frames()).min(pitch.len());
    for f in 0..frames {
        let weight = if pitch.fine[f] > 0.0 { 1.0 } else { protect };
        if weight >= 1.0 {
            continue;
        }
        let orig = feats0.row(f);
        for (v, o) in feats.row_mut(f).iter_mut().zip(orig) {
            *v = *v * weight + *o * (1.0 - weight);
        }
    }
}

/// Strip `t_pad_tgt` samples per side. Output too short for the full
/// trim either becomes silence (when under half the expected length,
/// the waveform is assumed degenerate) or passes through untrimmed.
fn trim_padding(raw: Vec<f32>, t_pad_tgt: usize, expected: usize) -> Vec<f32> {
    if raw.len() > 2 * t_pad_tgt {
        raw[t_pad_tgt..raw.len() - t_pad_tgt].to_vec()
    } else if raw.len() < expected / 2 {
        vec![0.0; expected]
    } else {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::stub::StubBackend;
    use crate::session::ResourceSession;
    use std::path::Path;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn ready_snapshot(backend: Arc<StubBackend>) -> Arc<SessionSnapshot> {
        let mut session = ResourceSession::new(backend as _);
        session.load_embedder("contentvec", None).unwrap();
        session.load_generator(Path::new("model.onnx"), 0).unwrap();
        session
            .load_retrieval_index(Some(Path::new("Cargo.toml")))
            .unwrap();
        session.snapshot().unwrap()
    }

    fn sine(len: usize, hz: f32, rate: f32) -> Vec<f32> {
        (0..len)
            .map(|i| 0.3 * (std::f32::consts::TAU * hz * i as f32 / rate).sin())
            .collect()
    }

    #[test]
    fn output_length_matches_rate_ratio() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new().with_target_rate(40_000)));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
    }

    #[test]
    fn output_peak_is_bounded() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new()));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        let peak = out.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!(peak <= 0.99 + 1e-6);
        assert!(out.iter().all(|s| s.is_finite()));
    }

    #[test]
    fn zero_pitch_method_skips_the_predictor() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new()));
        let mut processor = ChunkProcessor::new();
        let settings = ConversionSettings {
            pitch_method: PitchMethod::Zero,
            ..Default::default()
        };
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &settings, &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
    }

    #[test]
    fn non_f0_model_runs_without_pitch() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new().without_pitch()));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
    }

    #[test]
    fn degenerate_synthesis_yields_silence_of_expected_length() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new().with_short_output(0)));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn too_short_synthesis_output_becomes_silence() {
        // 100 samples cannot absorb the 2 * 4000-sample trim and fall
        // under half the 8000-sample expected length; the whole block
        // is discarded as degenerate.
        let snapshot = ready_snapshot(Arc::new(StubBackend::new().with_short_output(100)));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
        assert!(out.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn untrimmable_but_substantial_output_passes_through() {
        // 5000 samples cannot absorb the trim but exceed half the
        // expected 8000; the waveform is kept untrimmed and the length
        // contract pads the tail.
        let snapshot = ready_snapshot(Arc::new(StubBackend::new().with_short_output(5000)));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        let out = processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(out.len(), 3200 * 40_000 / 16_000);
        assert!(out[..5000].iter().any(|s| *s != 0.0));
        assert!(out[5000..].iter().all(|s| *s == 0.0));
    }

    #[test]
    fn envelope_reference_is_the_unfiltered_input() {
        // A loud sub-cutoff tone must drive the envelope transfer even
        // though the high-pass strips it from the conversion path.
        let snapshot = ready_snapshot(Arc::new(StubBackend::new()));
        let mut processor = ChunkProcessor::new();
        let input: Vec<f32> = (0..3200)
            .map(|i| 0.9 * (std::f32::consts::TAU * 10.0 * i as f32 / 16_000.0).sin())
            .collect();
        let settings = ConversionSettings {
            envelope_mix: 0.0,
            ..Default::default()
        };
        let out = processor.process(&snapshot, &settings, &input);
        let rms = (out.iter().map(|s| s * s).sum::<f32>() / out.len() as f32).sqrt();
        assert!(rms > 0.3, "output level did not follow the input: rms {rms}");
    }

    #[test]
    fn empty_input_yields_empty_output() {
        let snapshot = ready_snapshot(Arc::new(StubBackend::new()));
        let mut processor = ChunkProcessor::new();
        let out = processor.process(&snapshot, &ConversionSettings::default(), &[]);
        assert!(out.is_empty());
    }

    #[test]
    fn each_block_runs_the_embedder_once() {
        let backend = Arc::new(StubBackend::new());
        let snapshot = ready_snapshot(Arc::clone(&backend));
        let mut processor = ChunkProcessor::new();
        let input = sine(3200, 220.0, 16_000.0);
        processor.process(&snapshot, &ConversionSettings::default(), &input);
        processor.process(&snapshot, &ConversionSettings::default(), &input);
        assert_eq!(backend.extract_calls.load(Ordering::Relaxed), 2);
    }
}
