//! Deterministic in-process backend for tests and benchmarks.
//!
//! Produces shape-correct tensors with no model weights: the embedder
//! emits one frame per 320 input samples, the synthesizer emits
//! `frame_len * WINDOW * target_rate / feature_rate` samples of a quiet
//! sine. Load-call counters make idempotence observable.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::config::{FEATURE_RATE, WINDOW};
use crate::error::{Result, RevoiceError};
use crate::pitch::{PitchMethod, PitchTrack};

use super::backend::{
    ConversionBackend, EmbedderHandle, FeatureExtractor, GeneratorInfo, ModelVersion,
    PitchHandle, PitchPredictor, SynthHandle, Synthesizer,
};
use super::features::FeatureTensor;
use super::retrieval::IndexData;

/// One embedder frame covers 320 input samples (two analysis windows).
const EMBED_HOP: usize = 2 * WINDOW;

pub struct StubEmbedder {
    dim: usize,
    pub extract_calls: Arc<AtomicUsize>,
}

impl FeatureExtractor for StubEmbedder {
    fn identity(&self) -> &str {
        "stub"
    }

    fn extract(&mut self, padded: &[f32]) -> Result<FeatureTensor> {
        self.extract_calls.fetch_add(1, Ordering::Relaxed);
        let frames = padded.len() / EMBED_HOP;
        let mut tensor = FeatureTensor::zeros(frames, self.dim);
        // Encode the frame energy in the first component so retrieval
        // and blending have something non-degenerate to chew on.
        for f in 0..frames {
            let chunk = &padded[f * EMBED_HOP..(f + 1) * EMBED_HOP];
            let energy = chunk.iter().map(|s| s * s).sum::<f32>() / EMBED_HOP as f32;
            tensor.row_mut(f)[0] = energy.sqrt();
        }
        Ok(tensor)
    }
}

pub struct StubPitch {
    f0_hz: f32,
}

impl PitchPredictor for StubPitch {
    fn estimate(&mut self, _padded: &[f32], frame_count: usize) -> Result<Vec<f32>> {
        Ok(vec![self.f0_hz; frame_count])
    }
}

pub struct StubSynthesizer {
    target_rate: u32,
    /// When set, emit this many samples instead of the natural length.
    short_output: Option<usize>,
}

impl Synthesizer for StubSynthesizer {
    fn synthesize(
        &mut self,
        features: &FeatureTensor,
        frame_len: usize,
        pitch: Option<&PitchTrack>,
        _speaker_id: u32,
    ) -> Result<Vec<f32>> {
        if features.frames() == 0 {
            return Err(RevoiceError::Processing("empty feature tensor".into()));
        }
        let natural = frame_len * WINDOW * self.target_rate as usize / FEATURE_RATE as usize;
        let len = self.short_output.unwrap_or(natural);

        let base_hz = pitch
            .and_then(|p| p.fine.iter().copied().find(|f| *f > 0.0))
            .unwrap_or(220.0);
        let step = std::f32::consts::TAU * base_hz / self.target_rate as f32;
        Ok((0..len).map(|i| 0.1 * (i as f32 * step).sin()).collect())
    }
}

/// Backend whose loads always succeed (unless told otherwise) and count
/// how often they were asked to do real work.
pub struct StubBackend {
    pub embedder_loads: Arc<AtomicUsize>,
    pub generator_loads: Arc<AtomicUsize>,
    pub index_loads: Arc<AtomicUsize>,
    /// Shared with every embedder handed out.
    pub extract_calls: Arc<AtomicUsize>,
    target_rate: u32,
    uses_pitch: bool,
    f0_hz: f32,
    short_output: Option<usize>,
    fail_generator: bool,
    fail_index: bool,
}

impl StubBackend {
    pub fn new() -> Self {
        Self {
            embedder_loads: Arc::new(AtomicUsize::new(0)),
            generator_loads: Arc::new(AtomicUsize::new(0)),
            index_loads: Arc::new(AtomicUsize::new(0)),
            extract_calls: Arc::new(AtomicUsize::new(0)),
            target_rate: 40_000,
            uses_pitch: true,
            f0_hz: 220.0,
            short_output: None,
            fail_generator: false,
            fail_index: false,
        }
    }

    pub fn with_target_rate(mut self, rate: u32) -> Self {
        self.target_rate = rate;
        self
    }

    pub fn without_pitch(mut self) -> Self {
        self.uses_pitch = false;
        self
    }

    pub fn with_f0(mut self, hz: f32) -> Self {
        self.f0_hz = hz;
        self
    }

    /// Force the synthesizer to emit `len` samples regardless of input.
    pub fn with_short_output(mut self, len: usize) -> Self {
        self.short_output = Some(len);
        self
    }

    pub fn failing_generator(mut self) -> Self {
        self.fail_generator = true;
        self
    }

    pub fn failing_index(mut self) -> Self {
        self.fail_index = true;
        self
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversionBackend for StubBackend {
    fn load_embedder(&self, _name: &str, _custom_path: Option<&Path>) -> Result<EmbedderHandle> {
        self.embedder_loads.fetch_add(1, Ordering::Relaxed);
        Ok(EmbedderHandle::new(StubEmbedder {
            dim: ModelVersion::V2.hidden_dim(),
            extract_calls: Arc::clone(&self.extract_calls),
        }))
    }

    fn load_generator(&self, model_path: &Path) -> Result<(SynthHandle, GeneratorInfo)> {
        if self.fail_generator {
            return Err(RevoiceError::ModelNotFound {
                path: model_path.to_path_buf(),
            });
        }
        self.generator_loads.fetch_add(1, Ordering::Relaxed);
        let info = GeneratorInfo {
            target_rate: self.target_rate,
            uses_pitch: self.uses_pitch,
            version: ModelVersion::V2,
            vocoder: "stub".to_string(),
            speaker_count: 2,
            embedding_dim: ModelVersion::V2.hidden_dim(),
        };
        let handle = SynthHandle::new(StubSynthesizer {
            target_rate: self.target_rate,
            short_output: self.short_output,
        });
        Ok((handle, info))
    }

    fn load_index(&self, index_path: &Path) -> Result<IndexData> {
        if self.fail_index {
            return Err(RevoiceError::ResourceLoad(format!(
                "unreadable index: {}",
                index_path.display()
            )));
        }
        self.index_loads.fetch_add(1, Ordering::Relaxed);
        let dim = ModelVersion::V2.hidden_dim();
        let count = 8;
        let vectors = (0..count * dim)
            .map(|i| ((i % 17) as f32) * 0.05)
            .collect();
        IndexData::new(vectors, count, dim)
    }

    fn pitch_predictor(&self, method: PitchMethod) -> Result<PitchHandle> {
        match method {
            PitchMethod::Zero => Err(RevoiceError::Processing(
                "zero pitch method has no predictor".into(),
            )),
            _ => Ok(PitchHandle::new(StubPitch { f0_hz: self.f0_hz })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedder_frame_count_tracks_input_length() {
        let backend = StubBackend::new();
        let handle = backend.load_embedder("contentvec", None).unwrap();
        let input = vec![0.0f32; 4800];
        let tensor = handle.lock().extract(&input).unwrap();
        assert_eq!(tensor.frames(), 4800 / 320);
        assert_eq!(tensor.dim(), 768);
        assert_eq!(backend.extract_calls.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn synthesizer_output_length_scales_with_target_rate() {
        let backend = StubBackend::new().with_target_rate(32_000);
        let (handle, info) = backend.load_generator(Path::new("m.onnx")).unwrap();
        assert_eq!(info.target_rate, 32_000);
        let features = FeatureTensor::zeros(30, 768);
        let out = handle.lock().synthesize(&features, 30, None, 0).unwrap();
        assert_eq!(out.len(), 30 * WINDOW * 2); // 32k = 2 * 16k
    }

    #[test]
    fn pitch_predictor_is_constant() {
        let backend = StubBackend::new().with_f0(110.0);
        let handle = backend.pitch_predictor(PitchMethod::Rmvpe).unwrap();
        let f0 = handle.lock().estimate(&[0.0; 3200], 20).unwrap();
        assert_eq!(f0.len(), 20);
        assert!(f0.iter().all(|v| (*v - 110.0).abs() < f32::EPSILON));
    }
}
