use thiserror::Error;

/// All errors produced by revoice-core.
#[derive(Debug, Error)]
pub enum RevoiceError {
    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("audio stream error: {0}")]
    AudioStream(String),

    #[error("no matching audio device found: {0}")]
    DeviceNotFound(String),

    #[error("invalid sample rate: {0}")]
    InvalidRate(String),

    #[error("resource load error: {0}")]
    ResourceLoad(String),

    #[error("model file not found: {path}")]
    ModelNotFound { path: std::path::PathBuf },

    #[error("processing error: {0}")]
    Processing(String),

    #[error("stream is already running")]
    AlreadyRunning,

    #[error("stream is not running")]
    NotRunning,

    #[error("ONNX session error: {0}")]
    OnnxSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, RevoiceError>;
