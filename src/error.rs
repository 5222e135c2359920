//! Error types for audio-ddpm-edit.

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Which diffusion driver a numerical failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Inversion,
    Sampling,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inversion => write!(f, "inversion"),
            Self::Sampling => write!(f, "sampling"),
        }
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Candle tensor/model error outside the diffusion loop.
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),

    /// A diffusion step failed. The whole run is void; nothing partial is usable.
    #[error("{stage} failed at step {step}: {source}")]
    Diffusion {
        stage: Stage,
        step: usize,
        #[source]
        source: Box<Error>,
    },

    /// The requested model could not be loaded.
    #[error("loading model '{model}': {reason}")]
    ModelLoad { model: String, reason: String },

    /// A request parameter was rejected before any model work started.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Audio processing error (STFT, resampling, WAV/OGG I/O).
    #[error("audio: {0}")]
    Audio(String),

    /// Invalid configuration.
    #[error("config: {0}")]
    Config(String),

    /// The edit manager worker is gone or dropped a reply.
    #[error("manager: {0}")]
    Manager(String),

    /// I/O error.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wrap an error raised inside a diffusion driver at `step`.
    pub(crate) fn in_step(stage: Stage, step: usize) -> impl FnOnce(Error) -> Error {
        move |source| Error::Diffusion {
            stage,
            step,
            source: Box::new(source),
        }
    }
}

impl From<hound::Error> for Error {
    fn from(error: hound::Error) -> Self {
        Error::Audio(error.to_string())
    }
}
