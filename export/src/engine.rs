//! Inference engine seam.
//!
//! Verification and the smoke test only need "open an artifact, run audio
//! through it"; [`OrtEngine`] provides that over ONNX Runtime and tests
//! substitute their own engines.

use std::path::Path;

use speechport_onnx::{ElementType, Env, Session, Tensor};
use tracing::debug;

use crate::audio::AudioTensor;
use crate::error::ExportError;

/// One output tensor of an inference call.
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceOutput {
    pub shape: Vec<usize>,
    pub element_type: ElementType,
    /// Row-major values; empty unless the element type is float32.
    pub data: Vec<f32>,
}

/// Opens artifacts for execution.
pub trait InferenceEngine {
    /// Builds a session bound to the artifact at `path`. A session sees the
    /// artifact as it was when opened; reopen to pick up a new export.
    fn open(&self, path: &Path) -> Result<Box<dyn InferenceSession>, ExportError>;
}

/// A loaded artifact.
pub trait InferenceSession {
    fn run(&mut self, input: &AudioTensor) -> Result<InferenceOutput, ExportError>;
}

/// ONNX Runtime backed engine.
pub struct OrtEngine {
    env: Env,
    input_name: String,
    output_name: String,
}

impl OrtEngine {
    pub fn new(
        input_name: impl Into<String>,
        output_name: impl Into<String>,
        intra_threads: usize,
    ) -> Result<Self, ExportError> {
        let env = Env::new("speechport")
            .map_err(|e| ExportError::Inference(e.to_string()))?
            .with_intra_threads(intra_threads);
        Ok(Self {
            env,
            input_name: input_name.into(),
            output_name: output_name.into(),
        })
    }
}

impl InferenceEngine for OrtEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn InferenceSession>, ExportError> {
        let session = self
            .env
            .open_session(path)
            .map_err(|e| ExportError::Inference(e.to_string()))?;
        debug!(
            inputs = ?session.inputs().iter().map(|s| &s.name).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|s| &s.name).collect::<Vec<_>>(),
            "session ready"
        );
        Ok(Box::new(OrtSession {
            session,
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
        }))
    }
}

struct OrtSession {
    session: Session,
    input_name: String,
    output_name: String,
}

impl InferenceSession for OrtSession {
    fn run(&mut self, input: &AudioTensor) -> Result<InferenceOutput, ExportError> {
        let [batch, samples] = input.shape();
        let tensor = Tensor::new(&[batch as i64, samples as i64], input.data())
            .map_err(|e| ExportError::Inference(e.to_string()))?;
        let mut outputs = self
            .session
            .run(&[self.input_name.as_str()], &[&tensor], &[self.output_name.as_str()])
            .map_err(|e| ExportError::Inference(e.to_string()))?;
        let out = outputs
            .pop()
            .ok_or_else(|| ExportError::Inference("no output produced".into()))?;

        let shape = out
            .shape()
            .iter()
            .map(|&d| usize::try_from(d))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ExportError::Shape(format!("negative dim in {:?}", out.shape())))?;
        let element_type = out.element_type().clone();
        let data = match element_type {
            ElementType::Float32 => out
                .into_float_data()
                .map_err(|e| ExportError::Inference(e.to_string()))?,
            _ => Vec::new(),
        };
        Ok(InferenceOutput {
            shape,
            element_type,
            data,
        })
    }
}
