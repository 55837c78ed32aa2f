//! Safe wrappers for the ONNX Runtime environment, sessions and tensors.

use std::path::Path;

use once_cell::sync::OnceCell;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::{Session as OrtSession, SessionInputValue};
use ort::tensor::TensorElementType;
use ort::value::{ValueRef, ValueType};
use tracing::{debug, warn};

use crate::error::OnnxError;

/// Name of the process-wide ORT environment, set by the first [`Env::new`].
static COMMITTED_ENV: OnceCell<String> = OnceCell::new();

fn runtime(e: impl std::fmt::Display) -> OnnxError {
    OnnxError::Runtime(e.to_string())
}

// ---------------------------------------------------------------------------
// Env
// ---------------------------------------------------------------------------

/// ONNX Runtime environment. ORT keeps one environment per process; the
/// first `Env` commits it and later ones share it.
pub struct Env {
    intra_threads: usize,
}

impl Env {
    /// Creates (or joins) the ONNX Runtime environment.
    pub fn new(name: &str) -> Result<Self, OnnxError> {
        if name.is_empty() {
            return Err(OnnxError::Runtime("empty environment name".into()));
        }
        let committed = COMMITTED_ENV.get_or_init(|| {
            // Only the first commit in a process takes effect.
            match ort::init().with_name(name).commit() {
                Ok(_) => debug!("onnx: committed environment {name:?}"),
                Err(e) => warn!("onnx: commit environment {name:?}: {e}"),
            }
            name.to_string()
        });
        if committed != name {
            debug!("onnx: env {name:?} shares committed environment {committed:?}");
        }
        Ok(Self { intra_threads: 0 })
    }

    /// Sets the intra-op thread count for sessions opened from this Env.
    /// Zero leaves the ORT default.
    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads;
        self
    }

    /// Opens a session bound to the model file at `path`. External data
    /// files are resolved next to the model and owned by the session.
    pub fn open_session(&self, path: impl AsRef<Path>) -> Result<Session, OnnxError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(OnnxError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "model file not found"),
            });
        }
        let session = self
            .builder()?
            .commit_from_file(path)
            .map_err(|e| OnnxError::Runtime(format!("load {path:?}: {e}")))?;
        debug!("onnx: opened session for {:?}", path);
        Session::wrap(session)
    }

    fn builder(&self) -> Result<SessionBuilder, OnnxError> {
        let mut builder = OrtSession::builder()
            .map_err(runtime)?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(runtime)?;
        if self.intra_threads > 0 {
            builder = builder
                .with_intra_threads(self.intra_threads)
                .map_err(runtime)?;
        }
        Ok(builder)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Name, element type and dims of a session input or output.
/// Dynamic dims are reported as -1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoSpec {
    pub name: String,
    pub element_type: ElementType,
    pub dims: Vec<i64>,
}

/// Holds a loaded ONNX model.
pub struct Session {
    session: OrtSession,
    inputs: Vec<IoSpec>,
    outputs: Vec<IoSpec>,
}

impl Session {
    fn wrap(session: OrtSession) -> Result<Self, OnnxError> {
        let inputs = session
            .inputs
            .iter()
            .map(|i| io_spec(&i.name, &i.input_type))
            .collect::<Result<Vec<_>, _>>()?;
        let outputs = session
            .outputs
            .iter()
            .map(|o| io_spec(&o.name, &o.output_type))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }

    pub fn inputs(&self) -> &[IoSpec] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[IoSpec] {
        &self.outputs
    }

    /// Runs inference with the given inputs and output names.
    pub fn run(
        &mut self,
        input_names: &[&str],
        inputs: &[&Tensor],
        output_names: &[&str],
    ) -> Result<Vec<Tensor>, OnnxError> {
        if input_names.len() != inputs.len() {
            return Err(OnnxError::Runtime(format!(
                "input names/tensors length mismatch: {} vs {}",
                input_names.len(),
                inputs.len()
            )));
        }

        let mut ort_inputs = Vec::with_capacity(inputs.len());
        for (name, tensor) in input_names.iter().zip(inputs) {
            let dims = tensor
                .shape
                .iter()
                .map(|&d| d as usize)
                .collect::<Vec<usize>>();
            let value = ort::value::Tensor::from_array((dims, tensor.data.clone()))
                .map_err(runtime)?
                .into_dyn();
            ort_inputs.push((name.to_string(), SessionInputValue::from(value)));
        }

        let outputs = self.session.run(ort_inputs).map_err(runtime)?;
        let mut produced = Vec::with_capacity(outputs.len());
        for (name, value) in outputs.iter() {
            produced.push((name.to_string(), Tensor::from_value(&value)?));
        }

        let mut result = Vec::with_capacity(output_names.len());
        for want in output_names {
            let idx = produced
                .iter()
                .position(|(name, _)| name == want)
                .ok_or_else(|| OnnxError::Runtime(format!("model has no output {want:?}")))?;
            result.push(produced.swap_remove(idx).1);
        }
        Ok(result)
    }
}

fn io_spec(name: &str, value_type: &ValueType) -> Result<IoSpec, OnnxError> {
    let ValueType::Tensor { ty, shape, .. } = value_type else {
        return Err(OnnxError::Runtime(format!(
            "{name:?} is not a tensor value"
        )));
    };
    Ok(IoSpec {
        name: name.to_string(),
        element_type: ElementType::from(*ty),
        dims: shape.iter().copied().collect(),
    })
}

// ---------------------------------------------------------------------------
// Tensor
// ---------------------------------------------------------------------------

/// Element type of a tensor value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementType {
    Float32,
    Float16,
    Float64,
    Int64,
    Int32,
    Int8,
    Uint8,
    Bool,
    Other(String),
}

impl From<TensorElementType> for ElementType {
    fn from(ty: TensorElementType) -> Self {
        match ty {
            TensorElementType::Float32 => Self::Float32,
            TensorElementType::Float16 => Self::Float16,
            TensorElementType::Float64 => Self::Float64,
            TensorElementType::Int64 => Self::Int64,
            TensorElementType::Int32 => Self::Int32,
            TensorElementType::Int8 => Self::Int8,
            TensorElementType::Uint8 => Self::Uint8,
            TensorElementType::Bool => Self::Bool,
            other => Self::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float32 => f.write_str("float32"),
            Self::Float16 => f.write_str("float16"),
            Self::Float64 => f.write_str("float64"),
            Self::Int64 => f.write_str("int64"),
            Self::Int32 => f.write_str("int32"),
            Self::Int8 => f.write_str("int8"),
            Self::Uint8 => f.write_str("uint8"),
            Self::Bool => f.write_str("bool"),
            Self::Other(s) => f.write_str(s),
        }
    }
}

/// N-dimensional tensor. Inputs are always float32; outputs keep their
/// element type and carry data only when it is float32.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    shape: Vec<i64>,
    element_type: ElementType,
    data: Vec<f32>,
}

impl Tensor {
    /// Creates a float32 tensor with the given shape and data.
    pub fn new(shape: &[i64], data: &[f32]) -> Result<Self, OnnxError> {
        if data.is_empty() {
            return Err(OnnxError::EmptyData);
        }
        if let Some(d) = shape.iter().find(|&&d| d < 0) {
            return Err(OnnxError::Runtime(format!(
                "tensor shape {shape:?} has negative dim {d}"
            )));
        }

        let total: i64 = shape.iter().product();
        if (data.len() as i64) < total {
            return Err(OnnxError::Runtime(format!(
                "tensor data too short: got {}, need {total}",
                data.len()
            )));
        }

        Ok(Self {
            shape: shape.to_vec(),
            element_type: ElementType::Float32,
            data: data[..total as usize].to_vec(),
        })
    }

    fn from_value(value: &ValueRef<'_>) -> Result<Self, OnnxError> {
        let ValueType::Tensor { ty, shape, .. } = value.dtype() else {
            return Err(OnnxError::Runtime("non-tensor outputs are not supported".into()));
        };
        let element_type = ElementType::from(*ty);
        let data = match element_type {
            ElementType::Float32 => value
                .try_extract_array::<f32>()
                .map_err(runtime)?
                .iter()
                .copied()
                .collect(),
            _ => Vec::new(),
        };
        Ok(Self {
            shape: shape.iter().copied().collect(),
            element_type,
            data,
        })
    }

    /// Returns the tensor dimensions.
    pub fn shape(&self) -> &[i64] {
        &self.shape
    }

    pub fn element_type(&self) -> &ElementType {
        &self.element_type
    }

    /// Returns the float32 data, or an error for other element types.
    pub fn float_data(&self) -> Result<&[f32], OnnxError> {
        match self.element_type {
            ElementType::Float32 => Ok(&self.data),
            ref other => Err(OnnxError::Runtime(format!(
                "tensor holds {other}, not float32"
            ))),
        }
    }

    /// Consumes the tensor and returns its float32 data.
    pub fn into_float_data(self) -> Result<Vec<f32>, OnnxError> {
        self.float_data()?;
        Ok(self.data)
    }
}
