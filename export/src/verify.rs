//! Output contract checks for the exported encoder.

use std::path::Path;

use serde::Serialize;
use speechport_onnx::ElementType;
use tracing::info;

use crate::audio::AudioTensor;
use crate::engine::{InferenceEngine, InferenceOutput};
use crate::error::ExportError;
use crate::model::EncoderConfig;

/// Shape the encoder must produce for a given input: `[batch, frames, hidden]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExpectedOutput {
    pub batch: usize,
    pub frames: usize,
    pub hidden_size: usize,
    pub frame_tolerance: usize,
}

impl ExpectedOutput {
    pub fn for_input(encoder: &EncoderConfig, input: &AudioTensor, frame_tolerance: usize) -> Self {
        Self {
            batch: input.batch(),
            frames: encoder.frames_for(input.samples()),
            hidden_size: encoder.hidden_size,
            frame_tolerance,
        }
    }
}

/// Result of one verified forward pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verification {
    pub input_shape: Vec<usize>,
    pub output_shape: Vec<usize>,
    pub dtype: String,
    pub expected: ExpectedOutput,
}

/// Checks rank, batch, frame count, hidden width and dtype. Values are not
/// compared.
pub fn verify_output(output: &InferenceOutput, expected: &ExpectedOutput) -> Result<(), ExportError> {
    let shape = &output.shape;
    if shape.len() != 3 {
        return Err(ExportError::Shape(format!(
            "expected rank 3 [batch, time, hidden], got {shape:?}"
        )));
    }
    if shape[0] != expected.batch {
        return Err(ExportError::Shape(format!(
            "batch {} != {} in {shape:?}",
            shape[0], expected.batch
        )));
    }
    if shape[1].abs_diff(expected.frames) > expected.frame_tolerance {
        return Err(ExportError::Shape(format!(
            "{} frames, expected {} (±{}) in {shape:?}",
            shape[1], expected.frames, expected.frame_tolerance
        )));
    }
    if shape[2] != expected.hidden_size {
        return Err(ExportError::Shape(format!(
            "hidden size {} != {} in {shape:?}",
            shape[2], expected.hidden_size
        )));
    }
    if output.element_type != ElementType::Float32 {
        return Err(ExportError::DType {
            expected: ElementType::Float32.to_string(),
            got: output.element_type.to_string(),
        });
    }
    Ok(())
}

/// Opens a fresh session on `path`, runs `input` once and checks the output.
pub fn verify_artifact(
    engine: &dyn InferenceEngine,
    path: &Path,
    input: &AudioTensor,
    expected: &ExpectedOutput,
) -> Result<Verification, ExportError> {
    info!("Testing with ONNX Runtime...");
    let mut session = engine.open(path)?;
    let output = session.run(input)?;
    verify_output(&output, expected)?;

    info!(
        "Input shape: {:?}, output shape: {:?} ({})",
        input.shape(),
        output.shape,
        output.element_type
    );
    Ok(Verification {
        input_shape: input.shape().to_vec(),
        output_shape: output.shape,
        dtype: output.element_type.to_string(),
        expected: *expected,
    })
}
