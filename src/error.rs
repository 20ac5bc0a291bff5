use std::path::PathBuf;
use thiserror::Error;

/// Result type alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Bad CLI values, missing files, out-of-range parameters. Reported
    /// before the pipeline starts; maps to exit code 1.
    #[error("configuration error: {0}")]
    Config(String),

    /// A model could not be loaded. Fatal at startup.
    #[error("failed to load model {path}: {message}")]
    ModelLoad { path: PathBuf, message: String },

    /// Inference failed mid-run; the owning stage has exhausted its
    /// outputs and exited.
    #[error("inference error in {stage} stage: {message}")]
    Inference {
        stage: &'static str,
        message: String,
    },

    /// WAV container rejected: wrong rate, channel count, or sample width.
    #[error("unsupported WAV input: {0}")]
    Wav(String),

    #[error("audio source error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ort(#[from] ort::Error),

    #[error(transparent)]
    Shape(#[from] ndarray::ShapeError),
}

impl Error {
    pub(crate) fn inference(stage: &'static str, message: impl Into<String>) -> Self {
        Error::Inference {
            stage,
            message: message.into(),
        }
    }
}
