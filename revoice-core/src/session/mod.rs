//! Resource session: the loaded, hot-swappable model bundle.
//!
//! ## Lifecycle
//!
//! ```text
//! ResourceSession::new(backend)          — empty, not ready
//!     └─► load_all(model, index, sid, embedder)
//!             └─► is_ready() == true, snapshot() == Some
//! ```
//!
//! Every load operation is idempotent by identity comparison (paths and
//! names, never value ranges): re-loading the same resource is a cheap
//! no-op success. `load_all` short-circuits on the first failure and
//! reports the most specific message.
//!
//! ## Swap discipline
//!
//! The audio path never calls load operations. It reads an immutable
//! `Arc<SessionSnapshot>` through `try_lock`, so a writer mid-swap costs
//! it one silent block, never a stall. A snapshot is rebuilt wholesale
//! after each successful load — all-or-nothing.

pub mod backend;
pub mod features;
pub mod retrieval;
pub mod stub;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{CONTEXT_SECS, FEATURE_RATE, WINDOW};
use crate::error::{Result, RevoiceError};
use crate::pitch::PitchMethod;
use backend::{
    ConversionBackend, EmbedderHandle, GeneratorInfo, PitchHandle, SynthHandle,
};
use retrieval::IndexData;

/// Padding and window constants derived from a generator's target rate.
#[derive(Debug, Clone, Copy)]
pub struct PipelineConstants {
    /// Fixed front-end rate (Hz).
    pub feature_rate: u32,
    /// Analysis window in samples at `feature_rate`.
    pub window: usize,
    /// Reflect-pad width at `feature_rate`, samples per side.
    pub t_pad: usize,
    /// Trim width at `target_rate`, samples per side.
    pub t_pad_tgt: usize,
    pub target_rate: u32,
}

impl PipelineConstants {
    pub fn for_target_rate(target_rate: u32) -> Self {
        Self {
            feature_rate: FEATURE_RATE,
            window: WINDOW,
            t_pad: (FEATURE_RATE as f32 * CONTEXT_SECS) as usize,
            t_pad_tgt: (target_rate as f32 * CONTEXT_SECS) as usize,
            target_rate,
        }
    }
}

/// Immutable view of a fully-loaded session, shared with the worker.
pub struct SessionSnapshot {
    pub embedder: EmbedderHandle,
    pub generator: SynthHandle,
    pub info: GeneratorInfo,
    pub constants: PipelineConstants,
    pub index: Option<Arc<IndexData>>,
    /// RMVPE bundle built at generator load; `None` for non-f0 models.
    pub rmvpe: Option<PitchHandle>,
    backend: Arc<dyn ConversionBackend>,
    pub speaker_id: u32,
}

impl SessionSnapshot {
    /// Resolve the predictor for `method`. RMVPE comes from the bundle
    /// built at load time; FCPE is constructed lazily per call.
    pub fn predictor_for(&self, method: PitchMethod) -> Result<PitchHandle> {
        match method {
            PitchMethod::Rmvpe => self.rmvpe.clone().ok_or_else(|| {
                RevoiceError::Processing("rmvpe predictor not initialised".into())
            }),
            PitchMethod::Fcpe => self.backend.pitch_predictor(PitchMethod::Fcpe),
            PitchMethod::Zero => Err(RevoiceError::Processing(
                "zero pitch method has no predictor".into(),
            )),
        }
    }
}

/// Owns the loaded model handles and their identities.
pub struct ResourceSession {
    backend: Arc<dyn ConversionBackend>,

    embedder: Option<EmbedderHandle>,
    embedder_name: Option<String>,

    generator: Option<SynthHandle>,
    generator_info: Option<GeneratorInfo>,
    model_path: Option<PathBuf>,
    speaker_id: u32,

    index: Option<Arc<IndexData>>,
    index_path: Option<PathBuf>,

    constants: Option<PipelineConstants>,
    rmvpe: Option<PitchHandle>,

    /// Rebuilt after every successful load; what the audio path reads.
    ready: Option<Arc<SessionSnapshot>>,
}

impl ResourceSession {
    pub fn new(backend: Arc<dyn ConversionBackend>) -> Self {
        Self {
            backend,
            embedder: None,
            embedder_name: None,
            generator: None,
            generator_info: None,
            model_path: None,
            speaker_id: 0,
            index: None,
            index_path: None,
            constants: None,
            rmvpe: None,
            ready: None,
        }
    }

    /// Load the embedder unless one with the same name is already loaded.
    pub fn load_embedder(&mut self, name: &str, custom_path: Option<&Path>) -> Result<()> {
        if self.embedder.is_some() && self.embedder_name.as_deref() == Some(name) {
            debug!(name, "embedder already loaded");
            return Ok(());
        }

        info!(name, "loading embedder");
        let handle = self.backend.load_embedder(name, custom_path)?;
        self.embedder = Some(handle);
        self.embedder_name = Some(name.to_string());
        self.refresh_ready();
        Ok(())
    }

    /// Load a generator container unless both the path and the speaker id
    /// already match the loaded state.
    ///
    /// Reinitialises the padding constants and the RMVPE bundle from the
    /// new target rate as a side effect.
    pub fn load_generator(&mut self, model_path: &Path, speaker_id: u32) -> Result<()> {
        if self.generator.is_some()
            && self.model_path.as_deref() == Some(model_path)
            && self.speaker_id == speaker_id
        {
            debug!(path = %model_path.display(), speaker_id, "generator already loaded");
            return Ok(());
        }

        info!(path = %model_path.display(), speaker_id, "loading generator");
        let (handle, info) = self.backend.load_generator(model_path)?;

        if (speaker_id as usize) >= info.speaker_count {
            return Err(RevoiceError::ResourceLoad(format!(
                "speaker id {speaker_id} out of range (model has {} speakers)",
                info.speaker_count
            )));
        }

        self.constants = Some(PipelineConstants::for_target_rate(info.target_rate));
        self.rmvpe = if info.uses_pitch {
            Some(self.backend.pitch_predictor(PitchMethod::Rmvpe)?)
        } else {
            None
        };

        info!(
            target_rate = info.target_rate,
            uses_pitch = info.uses_pitch,
            vocoder = %info.vocoder,
            "generator loaded"
        );

        self.generator = Some(handle);
        self.generator_info = Some(info);
        self.model_path = Some(model_path.to_path_buf());
        self.speaker_id = speaker_id;
        self.refresh_ready();
        Ok(())
    }

    /// Load (or clear) the retrieval index.
    ///
    /// `None` or a nonexistent path clears the index state and succeeds —
    /// running without retrieval is a supported configuration. A path
    /// that exists but fails to parse is an error.
    pub fn load_retrieval_index(&mut self, index_path: Option<&Path>) -> Result<()> {
        let Some(path) = index_path.filter(|p| p.exists()) else {
            if index_path.is_some() {
                warn!("index path does not exist — clearing index state");
            }
            self.index = None;
            self.index_path = None;
            self.refresh_ready();
            return Ok(());
        };

        if self.index.is_some() && self.index_path.as_deref() == Some(path) {
            debug!(path = %path.display(), "index already loaded");
            return Ok(());
        }

        info!(path = %path.display(), "loading retrieval index");
        let data = self.backend.load_index(path)?;
        info!(count = data.count, dim = data.dim, "index materialized");
        self.index = Some(Arc::new(data));
        self.index_path = Some(path.to_path_buf());
        self.refresh_ready();
        Ok(())
    }

    /// Load everything, short-circuiting on the first failure with the
    /// most specific message available.
    pub fn load_all(
        &mut self,
        model_path: &Path,
        index_path: Option<&Path>,
        speaker_id: u32,
        embedder_name: &str,
    ) -> Result<()> {
        if model_path.as_os_str().is_empty() {
            return Err(RevoiceError::ResourceLoad("model path is required".into()));
        }

        self.load_embedder(embedder_name, None).map_err(|e| {
            RevoiceError::ResourceLoad(format!("failed to load embedder '{embedder_name}': {e}"))
        })?;

        self.load_generator(model_path, speaker_id).map_err(|e| {
            RevoiceError::ResourceLoad(format!(
                "failed to load generator from {}: {e}",
                model_path.display()
            ))
        })?;

        self.load_retrieval_index(index_path).map_err(|e| {
            RevoiceError::ResourceLoad(format!(
                "failed to load index from {}: {e}",
                index_path.map(|p| p.display().to_string()).unwrap_or_default()
            ))
        })?;

        Ok(())
    }

    /// True iff embedder, generator and the derived pipeline
    /// configuration are all present.
    pub fn is_ready(&self) -> bool {
        self.embedder.is_some() && self.generator.is_some() && self.constants.is_some()
    }

    /// Immutable view for the audio path; `None` until ready.
    pub fn snapshot(&self) -> Option<Arc<SessionSnapshot>> {
        self.ready.clone()
    }

    fn refresh_ready(&mut self) {
        self.ready = match (&self.embedder, &self.generator, &self.generator_info, &self.constants)
        {
            (Some(embedder), Some(generator), Some(info), Some(constants)) => {
                Some(Arc::new(SessionSnapshot {
                    embedder: embedder.clone(),
                    generator: generator.clone(),
                    info: info.clone(),
                    constants: *constants,
                    index: self.index.clone(),
                    rmvpe: self.rmvpe.clone(),
                    backend: Arc::clone(&self.backend),
                    speaker_id: self.speaker_id,
                }))
            }
            _ => None,
        };
    }
}
