//! Collaborator contracts for the model resources.
//!
//! The engine never parses model containers or runs networks itself —
//! it talks to an embedder, a pitch predictor, a generator and an index
//! loader through these traits. `&mut self` on the inference methods
//! expresses that backends are stateful (session caches, scratch
//! tensors); all mutation is serialised through the handles'
//! `parking_lot::Mutex`.

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::pitch::{PitchMethod, PitchTrack};
use crate::session::features::FeatureTensor;
use crate::session::retrieval::IndexData;

/// Content-feature embedder (ContentVec-style).
pub trait FeatureExtractor: Send + 'static {
    /// Identity string used for the session's idempotence check.
    fn identity(&self) -> &str;

    /// Produce one embedding vector per analysis frame of the padded
    /// feature-rate audio.
    fn extract(&mut self, padded: &[f32]) -> Result<FeatureTensor>;
}

/// Fine-pitch estimator over padded feature-rate audio.
pub trait PitchPredictor: Send + 'static {
    /// Estimate a fine pitch curve (Hz, 0 = unvoiced), one value per
    /// frame; implementations resample their native hop to `frame_count`.
    fn estimate(&mut self, padded: &[f32], frame_count: usize) -> Result<Vec<f32>>;
}

/// Generator / vocoder producing target-rate audio from features.
pub trait Synthesizer: Send + 'static {
    /// Synthesize one waveform at the model's target rate.
    ///
    /// `frame_len` is the aligned frame count; `pitch` is `None` for
    /// models that do not consume f0.
    fn synthesize(
        &mut self,
        features: &FeatureTensor,
        frame_len: usize,
        pitch: Option<&PitchTrack>,
        speaker_id: u32,
    ) -> Result<Vec<f32>>;
}

macro_rules! collaborator_handle {
    ($(#[$doc:meta])* $name:ident, $trait:ident) => {
        $(#[$doc])*
        #[derive(Clone)]
        pub struct $name(pub Arc<Mutex<dyn $trait>>);

        impl $name {
            pub fn new<T: $trait>(inner: T) -> Self {
                Self(Arc::new(Mutex::new(inner)))
            }

            /// Acquire the collaborator for one inference call.
            pub fn lock(&self) -> parking_lot::MutexGuard<'_, dyn $trait> {
                self.0.lock()
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name)).finish_non_exhaustive()
            }
        }
    };
}

collaborator_handle!(
    /// Thread-safe reference-counted handle to a `FeatureExtractor`.
    EmbedderHandle,
    FeatureExtractor
);
collaborator_handle!(
    /// Thread-safe reference-counted handle to a `PitchPredictor`.
    PitchHandle,
    PitchPredictor
);
collaborator_handle!(
    /// Thread-safe reference-counted handle to a `Synthesizer`.
    SynthHandle,
    Synthesizer
);

/// Model container version tag, selecting the text-encoder hidden width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelVersion {
    /// Legacy models: 256-wide hidden states, projected embedder output.
    V1,
    /// Current models: 768-wide hidden states.
    V2,
}

impl ModelVersion {
    pub fn hidden_dim(self) -> usize {
        match self {
            Self::V1 => 256,
            Self::V2 => 768,
        }
    }
}

/// Metadata read from a loaded generator container.
#[derive(Debug, Clone)]
pub struct GeneratorInfo {
    /// Output sample rate of the generator (Hz), last element of the
    /// container's configuration vector.
    pub target_rate: u32,
    /// Whether the generator consumes coarse/fine pitch.
    pub uses_pitch: bool,
    pub version: ModelVersion,
    /// Vocoder family tag (e.g. "HiFi-GAN").
    pub vocoder: String,
    /// Number of speakers embedded in the generator weights.
    pub speaker_count: usize,
    /// Embedding dimension the generator expects per frame.
    pub embedding_dim: usize,
}

/// Factory for all loadable resources. Container parsing lives behind
/// this trait; the session only compares identities and wires handles.
pub trait ConversionBackend: Send + Sync + 'static {
    /// Load an embedder by name, optionally from a custom path.
    fn load_embedder(&self, name: &str, custom_path: Option<&Path>) -> Result<EmbedderHandle>;

    /// Parse a generator container and return the synthesizer plus its
    /// metadata.
    fn load_generator(&self, model_path: &Path) -> Result<(SynthHandle, GeneratorInfo)>;

    /// Load a retrieval index and materialize its full vector set.
    fn load_index(&self, index_path: &Path) -> Result<IndexData>;

    /// Construct a pitch predictor for `method`. Never called for
    /// [`PitchMethod::Zero`].
    fn pitch_predictor(&self, method: PitchMethod) -> Result<PitchHandle>;
}
