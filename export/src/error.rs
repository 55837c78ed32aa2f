use std::path::PathBuf;

use thiserror::Error;

/// Fatal pipeline errors. Any of these aborts the run.
///
/// Advisory outcomes (checksum mismatches, a missing test clip) are not
/// errors; they are reported through [`crate::IntegrityReport`] and
/// [`crate::SmokeOutcome`].
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("config: {0}")]
    Config(String),

    #[error("load model {id:?}: {message}")]
    Load { id: String, message: String },

    #[error("model {0:?} is still in training mode; call eval() before export")]
    TrainingMode(String),

    #[error("trace: {0}")]
    Trace(String),

    #[error("io {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("validation: {0}")]
    Validation(String),

    #[error("inference: {0}")]
    Inference(String),

    #[error("output shape: {0}")]
    Shape(String),

    #[error("output dtype: expected {expected}, got {got}")]
    DType { expected: String, got: String },

    #[error("audio {path:?}: {message}")]
    Audio { path: PathBuf, message: String },
}

impl ExportError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn load(id: &str, message: impl std::fmt::Display) -> Self {
        Self::Load {
            id: id.to_string(),
            message: message.to_string(),
        }
    }
}
