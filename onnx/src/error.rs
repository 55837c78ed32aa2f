use std::path::PathBuf;

use thiserror::Error;

/// Errors returned by ONNX Runtime and model checking operations.
#[derive(Debug, Error)]
pub enum OnnxError {
    #[error("onnx: {0}")]
    Runtime(String),

    #[error("onnx: empty data")]
    EmptyData,

    #[error("onnx: read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("onnx: decode model: {0}")]
    Decode(String),

    #[error("onnx: check failed at {at}: {message}")]
    Check { at: String, message: String },
}

impl OnnxError {
    pub(crate) fn check(at: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Check {
            at: at.into(),
            message: message.into(),
        }
    }
}
