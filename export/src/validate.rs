//! Structural gate between export and inference.

use std::path::Path;

use serde::Serialize;
use speechport_onnx::{check_model_file, proto::DataType, Dim, ModelSummary, ValueSummary};
use tracing::{debug, info};

use crate::error::ExportError;
use crate::exporter::ExportRequest;

/// Signature of one graph input or output, for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValueSignature {
    pub name: String,
    pub dtype: String,
    /// Dimensions as written in the graph: sizes, symbols or `?`.
    pub dims: Vec<String>,
}

impl From<&ValueSummary> for ValueSignature {
    fn from(v: &ValueSummary) -> Self {
        Self {
            name: v.name.clone(),
            dtype: v.elem_type.to_string(),
            dims: v.dims.iter().map(Dim::to_string).collect(),
        }
    }
}

/// What the structural check saw in a valid artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub ir_version: i64,
    pub opset_version: i64,
    pub producer: String,
    pub node_count: usize,
    pub initializer_count: usize,
    pub inputs: Vec<ValueSignature>,
    pub outputs: Vec<ValueSignature>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub external_files: Vec<String>,
}

impl From<&ModelSummary> for ValidationSummary {
    fn from(s: &ModelSummary) -> Self {
        Self {
            ir_version: s.ir_version,
            opset_version: s.opset_version,
            producer: s.producer.clone(),
            node_count: s.node_count,
            initializer_count: s.initializer_count,
            inputs: s.inputs.iter().map(ValueSignature::from).collect(),
            outputs: s.outputs.iter().map(ValueSignature::from).collect(),
            external_files: s.external_files.clone(),
        }
    }
}

/// Loads the graph at `path` on its own and checks it against the schema
/// and against what `request` asked the exporter for. Fails on the first
/// violation.
pub fn validate_artifact(
    path: impl AsRef<Path>,
    request: &ExportRequest,
) -> Result<ValidationSummary, ExportError> {
    let path = path.as_ref();
    info!("Verifying ONNX model...");

    let summary =
        check_model_file(path).map_err(|e| ExportError::Validation(format!("{path:?}: {e}")))?;
    check_against_request(&summary, request)?;

    debug!(
        nodes = summary.node_count,
        initializers = summary.initializer_count,
        external = ?summary.external_files,
        "structure ok"
    );
    info!(
        "ONNX model is valid (ir {}, opset {})",
        summary.ir_version, summary.opset_version
    );
    Ok(ValidationSummary::from(&summary))
}

fn check_against_request(summary: &ModelSummary, request: &ExportRequest) -> Result<(), ExportError> {
    let fail = |msg: String| Err(ExportError::Validation(msg));

    if summary.opset_version != request.opset_version {
        return fail(format!(
            "graph uses opset {} but {} was requested",
            summary.opset_version, request.opset_version
        ));
    }

    let Some(input) = summary.input(&request.input_name) else {
        return fail(format!("graph has no input {:?}", request.input_name));
    };
    let Some(output) = summary.output(&request.output_name) else {
        return fail(format!("graph has no output {:?}", request.output_name));
    };
    for value in [input, output] {
        if value.elem_type != DataType::FLOAT {
            return fail(format!(
                "{:?} is {} but FLOAT was expected",
                value.name, value.elem_type
            ));
        }
    }

    for (name, axes) in request.dynamic_axes.iter() {
        let Some(value) = summary.input(name).or_else(|| summary.output(name)) else {
            return fail(format!("dynamic axes declared for unknown value {name:?}"));
        };
        request
            .dynamic_axes
            .check_rank(name, value.dims.len())
            .map_err(ExportError::Validation)?;
        for (&axis, label) in axes {
            if let Dim::Fixed(size) = value.dims[axis] {
                return fail(format!(
                    "axis {axis} ({label}) of {name:?} was exported with fixed size {size}"
                ));
            }
        }
    }
    Ok(())
}
