//! ONNX Runtime backend via the `ort` crate.
//!
//! Targets the separate-graph RVC export layout:
//! - `<models>/<embedder>.onnx` — content encoder, waveform `[1,T]` →
//!   hidden states `[1,F,D]` (D = 256 for v1 exports, 768 for v2)
//! - generator `.onnx` — `phone`/`phone_lengths`/`ds` (+ `pitch`/`pitchf`
//!   for f0 models) → waveform
//! - `<models>/rmvpe.onnx`, `<models>/fcpe.onnx` — pitch predictors over
//!   a 128-bin log-mel frontend
//!
//! Generator containers carry no readable sample-rate metadata once
//! exported, so each generator is described by a sidecar JSON file next
//! to it (`model.onnx` → `model.json`). Missing sidecars fall back to
//! the common 40 kHz v2 f0 layout with a warning.

mod rmvpe;

use std::path::{Path, PathBuf};

use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use ort::value::TensorRef;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::{Result, RevoiceError};
use crate::pitch::{PitchMethod, PitchTrack};
use crate::session::backend::{
    ConversionBackend, EmbedderHandle, FeatureExtractor, GeneratorInfo, ModelVersion,
    PitchHandle, SynthHandle, Synthesizer,
};
use crate::session::features::FeatureTensor;
use crate::session::retrieval::IndexData;

pub use rmvpe::OnnxPitchPredictor;

/// Noise-latent channel count of the RVC synthesizer exports.
const RND_CHANNELS: usize = 192;

pub(crate) fn create_session(model_path: &Path) -> Result<Session> {
    if !model_path.exists() {
        return Err(RevoiceError::ModelNotFound {
            path: model_path.to_path_buf(),
        });
    }

    let logical_cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);
    let intra_threads = std::env::var("REVOICE_ORT_INTRA_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(logical_cores.clamp(2, 8))
        .clamp(1, 32);

    SessionBuilder::new()
        .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::All)
        .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| RevoiceError::OnnxSession(e.to_string()))
}

/// Sidecar description of a generator export.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct GeneratorMetadata {
    target_rate: u32,
    f0: bool,
    version: String,
    vocoder: String,
    speaker_count: usize,
}

impl Default for GeneratorMetadata {
    fn default() -> Self {
        Self {
            target_rate: 40_000,
            f0: true,
            version: "v2".to_string(),
            vocoder: "hifigan".to_string(),
            speaker_count: 1,
        }
    }
}

fn load_generator_metadata(model_path: &Path) -> GeneratorMetadata {
    let sidecar = model_path.with_extension("json");
    match std::fs::read_to_string(&sidecar) {
        Ok(raw) => match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(e) => {
                warn!(path = %sidecar.display(), "unparseable generator sidecar ({e}), using defaults");
                GeneratorMetadata::default()
            }
        },
        Err(_) => {
            warn!(path = %sidecar.display(), "no generator sidecar, assuming 40 kHz v2 f0 model");
            GeneratorMetadata::default()
        }
    }
}

pub struct OnnxEmbedder {
    session: Session,
    name: String,
    input_name: String,
    output_name: String,
}

impl OnnxEmbedder {
    fn new(model_path: &Path, name: &str) -> Result<Self> {
        let session = create_session(model_path)?;
        let input_name = session
            .inputs
            .first()
            .map(|i| i.name.clone())
            .ok_or_else(|| RevoiceError::OnnxSession("embedder graph has no inputs".into()))?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| RevoiceError::OnnxSession("embedder graph has no outputs".into()))?;
        info!(name, input = %input_name, output = %output_name, "embedder session ready");
        Ok(Self {
            session,
            name: name.to_string(),
            input_name,
            output_name,
        })
    }
}

impl FeatureExtractor for OnnxEmbedder {
    fn identity(&self) -> &str {
        &self.name
    }

    fn extract(&mut self, padded: &[f32]) -> Result<FeatureTensor> {
        let source = TensorRef::from_array_view(([1_i64, padded.len() as i64], padded))
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let outputs = self
            .session
            .run(ort::inputs![self.input_name.as_str() => source])
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let (shape, data) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;

        // [1, frames, dim]
        if shape.len() != 3 || shape[0] != 1 {
            return Err(RevoiceError::OnnxSession(format!(
                "unexpected embedder output shape: {shape:?}"
            )));
        }
        FeatureTensor::new(data.to_vec(), shape[1] as usize, shape[2] as usize)
    }
}

pub struct OnnxSynthesizer {
    session: Session,
    uses_pitch: bool,
    output_name: String,
}

impl OnnxSynthesizer {
    fn new(model_path: &Path, uses_pitch: bool) -> Result<Self> {
        let session = create_session(model_path)?;
        let output_name = session
            .outputs
            .first()
            .map(|o| o.name.clone())
            .ok_or_else(|| RevoiceError::OnnxSession("generator graph has no outputs".into()))?;
        Ok(Self {
            session,
            uses_pitch,
            output_name,
        })
    }
}

impl Synthesizer for OnnxSynthesizer {
    fn synthesize(
        &mut self,
        features: &FeatureTensor,
        frame_len: usize,
        pitch: Option<&PitchTrack>,
        speaker_id: u32,
    ) -> Result<Vec<f32>> {
        let frames = features.frames();
        let phone = TensorRef::from_array_view((
            [1_i64, frames as i64, features.dim() as i64],
            features.as_slice(),
        ))
        .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let lengths = [frame_len as i64];
        let phone_lengths = TensorRef::from_array_view(([1_i64], &lengths[..]))
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let ds = [speaker_id as i64];
        let ds_val = TensorRef::from_array_view(([1_i64], &ds[..]))
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        let rnd = vec![0f32; RND_CHANNELS * frames];
        let rnd_val =
            TensorRef::from_array_view(([1_i64, RND_CHANNELS as i64, frames as i64], &rnd[..]))
                .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;

        let outputs = if self.uses_pitch {
            let track = pitch.ok_or_else(|| {
                RevoiceError::Processing("f0 generator called without a pitch track".into())
            })?;
            let pitch_val =
                TensorRef::from_array_view(([1_i64, frames as i64], track.coarse.as_slice()))
                    .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
            let pitchf_val =
                TensorRef::from_array_view(([1_i64, frames as i64], track.fine.as_slice()))
                    .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
            self.session
                .run(ort::inputs![
                    "phone"         => phone,
                    "phone_lengths" => phone_lengths,
                    "pitch"         => pitch_val,
                    "pitchf"        => pitchf_val,
                    "ds"            => ds_val,
                    "rnd"           => rnd_val,
                ])
                .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?
        } else {
            self.session
                .run(ort::inputs![
                    "phone"         => phone,
                    "phone_lengths" => phone_lengths,
                    "ds"            => ds_val,
                    "rnd"           => rnd_val,
                ])
                .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?
        };

        let (_, audio) = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| RevoiceError::OnnxSession(e.to_string()))?;
        Ok(audio.to_vec())
    }
}

/// Backend wiring every collaborator to an ONNX Runtime session.
pub struct OnnxBackend {
    /// Directory holding the shared models (embedders, pitch predictors).
    models_dir: PathBuf,
}

impl OnnxBackend {
    pub fn new(models_dir: impl Into<PathBuf>) -> Self {
        Self {
            models_dir: models_dir.into(),
        }
    }

    fn shared_model_path(&self, stem: &str) -> PathBuf {
        self.models_dir.join(format!("{stem}.onnx"))
    }
}

impl ConversionBackend for OnnxBackend {
    fn load_embedder(&self, name: &str, custom_path: Option<&Path>) -> Result<EmbedderHandle> {
        let path = match custom_path {
            Some(p) => p.to_path_buf(),
            None => self.shared_model_path(name),
        };
        Ok(EmbedderHandle::new(OnnxEmbedder::new(&path, name)?))
    }

    fn load_generator(&self, model_path: &Path) -> Result<(SynthHandle, GeneratorInfo)> {
        let meta = load_generator_metadata(model_path);
        let version = match meta.version.as_str() {
            "v1" => ModelVersion::V1,
            _ => ModelVersion::V2,
        };
        let info = GeneratorInfo {
            target_rate: meta.target_rate,
            uses_pitch: meta.f0,
            version,
            vocoder: meta.vocoder,
            speaker_count: meta.speaker_count.max(1),
            embedding_dim: version.hidden_dim(),
        };
        let synth = OnnxSynthesizer::new(model_path, info.uses_pitch)?;
        Ok((SynthHandle::new(synth), info))
    }

    fn load_index(&self, index_path: &Path) -> Result<IndexData> {
        read_index_file(index_path)
    }

    fn pitch_predictor(&self, method: PitchMethod) -> Result<PitchHandle> {
        let stem = match method {
            PitchMethod::Rmvpe => "rmvpe",
            PitchMethod::Fcpe => "fcpe",
            PitchMethod::Zero => {
                return Err(RevoiceError::Processing(
                    "zero pitch method has no predictor".into(),
                ))
            }
        };
        let predictor = OnnxPitchPredictor::new(&self.shared_model_path(stem))?;
        Ok(PitchHandle::new(predictor))
    }
}

/// Flat binary layout: `count: u32 LE`, `dim: u32 LE`, then
/// `count * dim` little-endian f32 vectors, row-major.
fn read_index_file(path: &Path) -> Result<IndexData> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < 8 {
        return Err(RevoiceError::ResourceLoad(format!(
            "index file too small: {}",
            path.display()
        )));
    }
    let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let dim = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]) as usize;
    let expected = 8 + count * dim * 4;
    if bytes.len() != expected {
        return Err(RevoiceError::ResourceLoad(format!(
            "index file length mismatch: {} bytes, header says {count}x{dim}",
            bytes.len()
        )));
    }
    let vectors = bytes[8..]
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    IndexData::new(vectors, count, dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn index_file_round_trips() {
        let count = 3u32;
        let dim = 4u32;
        let mut file = tempfile_path("revoice-index-test.bin");
        {
            let mut f = std::fs::File::create(&file.0).unwrap();
            f.write_all(&count.to_le_bytes()).unwrap();
            f.write_all(&dim.to_le_bytes()).unwrap();
            for i in 0..(count * dim) {
                f.write_all(&(i as f32 * 0.5).to_le_bytes()).unwrap();
            }
        }
        let index = read_index_file(&file.0).unwrap();
        assert_eq!(index.count, 3);
        assert_eq!(index.dim, 4);
        assert_eq!(index.vectors[5], 2.5);
    }

    #[test]
    fn truncated_index_file_is_rejected() {
        let file = tempfile_path("revoice-index-trunc.bin");
        std::fs::write(&file.0, [1, 0, 0, 0, 4, 0]).unwrap();
        assert!(read_index_file(&file.0).is_err());
    }

    #[test]
    fn missing_model_is_a_not_found_error() {
        let err = create_session(Path::new("/nonexistent/model.onnx")).unwrap_err();
        assert!(matches!(err, RevoiceError::ModelNotFound { .. }));
    }

    #[test]
    fn sidecar_defaults_cover_a_missing_file() {
        let meta = load_generator_metadata(Path::new("/nonexistent/model.onnx"));
        assert_eq!(meta.target_rate, 40_000);
        assert!(meta.f0);
        assert_eq!(meta.version, "v2");
    }

    struct TempPath(PathBuf);
    impl Drop for TempPath {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.0);
        }
    }

    fn tempfile_path(name: &str) -> TempPath {
        TempPath(std::env::temp_dir().join(name))
    }
}
