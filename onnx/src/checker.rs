//! Structural checks for serialized ONNX models.
//!
//! The checker loads a model independently of whoever wrote it and fails
//! on the first schema violation. It never repairs anything.

use std::collections::{HashMap, HashSet};
use std::path::{Component, Path};

use tracing::debug;

use crate::error::OnnxError;
use crate::proto::{
    decode_model, tensor_shape_proto::dimension, DataType, GraphProto, ModelProto, TensorProto,
    ValueInfoProto, DATA_LOCATION_EXTERNAL,
};

/// Lowest IR version that carries opset imports.
pub const MIN_IR_VERSION: i64 = 3;
/// Highest IR version this checker understands.
pub const MAX_IR_VERSION: i64 = 11;
/// Highest default-domain opset this checker accepts.
pub const MAX_OPSET: i64 = 23;

const DEFAULT_DOMAIN: &str = "";
const DEFAULT_DOMAIN_ALIAS: &str = "ai.onnx";

/// One dimension of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
    Unknown,
}

impl Dim {
    /// Returns true when the dimension may vary per call.
    pub fn is_dynamic(&self) -> bool {
        !matches!(self, Dim::Fixed(_))
    }
}

impl std::fmt::Display for Dim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{v}"),
            Dim::Symbolic(s) => f.write_str(s),
            Dim::Unknown => f.write_str("?"),
        }
    }
}

/// Name, element type and dimensions of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueSummary {
    pub name: String,
    pub elem_type: DataType,
    pub dims: Vec<Dim>,
}

/// What a successful check learned about the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSummary {
    pub ir_version: i64,
    /// Version of the default (`ai.onnx`) operator set.
    pub opset_version: i64,
    pub producer: String,
    pub graph_name: String,
    pub node_count: usize,
    pub initializer_count: usize,
    pub inputs: Vec<ValueSummary>,
    pub outputs: Vec<ValueSummary>,
    /// External data files referenced by initializers, relative to the model.
    pub external_files: Vec<String>,
}

impl ModelSummary {
    pub fn input(&self, name: &str) -> Option<&ValueSummary> {
        self.inputs.iter().find(|v| v.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&ValueSummary> {
        self.outputs.iter().find(|v| v.name == name)
    }
}

/// Reads and checks the model file at `path`. External data is resolved
/// relative to the file's directory.
pub fn check_model_file(path: impl AsRef<Path>) -> Result<ModelSummary, OnnxError> {
    let path = path.as_ref();
    let bytes = std::fs::read(path).map_err(|source| OnnxError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!("checking {:?} ({} bytes)", path, bytes.len());
    let model = decode_model(&bytes)?;
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    check_model(&model, base_dir)
}

/// Checks a decoded model. `base_dir` is where external data files live.
pub fn check_model(model: &ModelProto, base_dir: &Path) -> Result<ModelSummary, OnnxError> {
    if model.ir_version < MIN_IR_VERSION || model.ir_version > MAX_IR_VERSION {
        return Err(OnnxError::check(
            "model.ir_version",
            format!(
                "unsupported IR version {} (supported {MIN_IR_VERSION}..={MAX_IR_VERSION})",
                model.ir_version
            ),
        ));
    }

    let opsets = check_opsets(model)?;
    let opset_version = opsets[DEFAULT_DOMAIN];

    let graph = model
        .graph
        .as_ref()
        .ok_or_else(|| OnnxError::check("model.graph", "missing graph"))?;
    if graph.name.is_empty() {
        return Err(OnnxError::check("graph.name", "graph name is empty"));
    }

    let mut external_files = Vec::new();
    let mut checker = GraphChecker {
        opsets: &opsets,
        base_dir,
        external_files: &mut external_files,
    };
    checker.check_graph(graph, "graph", &HashSet::new())?;

    let inputs = graph
        .input
        .iter()
        .enumerate()
        .map(|(i, v)| value_summary(v, &format!("graph.input[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;
    let outputs = graph
        .output
        .iter()
        .enumerate()
        .map(|(i, v)| value_summary(v, &format!("graph.output[{i}]")))
        .collect::<Result<Vec<_>, _>>()?;

    external_files.sort();
    external_files.dedup();

    Ok(ModelSummary {
        ir_version: model.ir_version,
        opset_version,
        producer: model.producer_name.clone(),
        graph_name: graph.name.clone(),
        node_count: graph.node.len(),
        initializer_count: graph.initializer.len(),
        inputs,
        outputs,
        external_files,
    })
}

/// Maps each imported domain (with `ai.onnx` folded into `""`) to its version.
fn check_opsets(model: &ModelProto) -> Result<HashMap<&str, i64>, OnnxError> {
    if model.opset_import.is_empty() {
        return Err(OnnxError::check("model.opset_import", "no opset imports"));
    }

    let mut opsets = HashMap::new();
    for (i, op) in model.opset_import.iter().enumerate() {
        let domain = match op.domain.as_str() {
            DEFAULT_DOMAIN_ALIAS => DEFAULT_DOMAIN,
            d => d,
        };
        if op.version < 1 {
            return Err(OnnxError::check(
                format!("model.opset_import[{i}]"),
                format!("domain {:?} has invalid version {}", op.domain, op.version),
            ));
        }
        if opsets.insert(domain, op.version).is_some() {
            return Err(OnnxError::check(
                format!("model.opset_import[{i}]"),
                format!("domain {:?} imported twice", op.domain),
            ));
        }
    }

    match opsets.get(DEFAULT_DOMAIN) {
        None => Err(OnnxError::check(
            "model.opset_import",
            "no import for the default domain",
        )),
        Some(&v) if v > MAX_OPSET => Err(OnnxError::check(
            "model.opset_import",
            format!("default domain opset {v} is newer than {MAX_OPSET}"),
        )),
        Some(_) => Ok(opsets),
    }
}

struct GraphChecker<'a> {
    opsets: &'a HashMap<&'a str, i64>,
    base_dir: &'a Path,
    external_files: &'a mut Vec<String>,
}

impl GraphChecker<'_> {
    /// Checks one graph. `outer` holds names visible from enclosing graphs.
    fn check_graph(
        &mut self,
        graph: &GraphProto,
        at: &str,
        outer: &HashSet<String>,
    ) -> Result<(), OnnxError> {
        let mut defined: HashSet<String> = outer.clone();
        let mut local: HashSet<&str> = HashSet::new();

        for (i, input) in graph.input.iter().enumerate() {
            let here = format!("{at}.input[{i}]");
            check_value_info(input, &here)?;
            if !local.insert(&input.name) {
                return Err(OnnxError::check(
                    here,
                    format!("duplicate input name {:?}", input.name),
                ));
            }
            defined.insert(input.name.clone());
        }

        let mut initializers: HashSet<&str> = HashSet::new();
        for (i, init) in graph.initializer.iter().enumerate() {
            let here = format!("{at}.initializer[{i}]");
            self.check_initializer(init, &here)?;
            if !initializers.insert(&init.name) {
                return Err(OnnxError::check(
                    here,
                    format!("duplicate initializer {:?}", init.name),
                ));
            }
            // An initializer may share its name with a graph input (default value).
            defined.insert(init.name.clone());
        }

        let mut produced: HashSet<&str> = HashSet::new();
        for (i, node) in graph.node.iter().enumerate() {
            let label = if node.name.is_empty() {
                node.op_type.as_str()
            } else {
                node.name.as_str()
            };
            let here = format!("{at}.node[{i}] ({label})");

            if node.op_type.is_empty() {
                return Err(OnnxError::check(here, "op_type is empty"));
            }
            let domain = match node.domain.as_str() {
                DEFAULT_DOMAIN_ALIAS => DEFAULT_DOMAIN,
                d => d,
            };
            if !self.opsets.contains_key(domain) {
                return Err(OnnxError::check(
                    here,
                    format!("no opset import for domain {:?}", node.domain),
                ));
            }

            for name in node.input.iter().filter(|n| !n.is_empty()) {
                if !defined.contains(name) {
                    return Err(OnnxError::check(
                        here,
                        format!("input {name:?} has no producer before this node"),
                    ));
                }
            }

            for attr in &node.attribute {
                let sub_at = format!("{here}.attribute({})", attr.name);
                if let Some(g) = &attr.g {
                    self.check_graph(g, &sub_at, &defined)?;
                }
                for (j, g) in attr.graphs.iter().enumerate() {
                    self.check_graph(g, &format!("{sub_at}[{j}]"), &defined)?;
                }
            }

            for name in node.output.iter().filter(|n| !n.is_empty()) {
                if local.contains(name.as_str())
                    || initializers.contains(name.as_str())
                    || !produced.insert(name)
                {
                    return Err(OnnxError::check(
                        here,
                        format!("output {name:?} is assigned more than once"),
                    ));
                }
                defined.insert(name.clone());
            }
        }

        for (i, output) in graph.output.iter().enumerate() {
            let here = format!("{at}.output[{i}]");
            check_value_info(output, &here)?;
            if !defined.contains(&output.name) {
                return Err(OnnxError::check(
                    here,
                    format!("output {:?} is never produced", output.name),
                ));
            }
        }

        for (i, info) in graph.value_info.iter().enumerate() {
            if let Some(tensor) = info.r#type.as_ref().and_then(|t| t.tensor_type.as_ref()) {
                let elem = DataType(tensor.elem_type);
                if tensor.elem_type != 0 && !elem.is_defined() {
                    return Err(OnnxError::check(
                        format!("{at}.value_info[{i}]"),
                        format!("unknown element type {}", tensor.elem_type),
                    ));
                }
            }
        }

        Ok(())
    }

    fn check_initializer(&mut self, init: &TensorProto, at: &str) -> Result<(), OnnxError> {
        if init.name.is_empty() {
            return Err(OnnxError::check(at, "initializer name is empty"));
        }
        let elem = DataType(init.data_type);
        if !elem.is_defined() {
            return Err(OnnxError::check(
                at,
                format!("{:?} has undefined element type {}", init.name, init.data_type),
            ));
        }
        if let Some((i, d)) = init.dims.iter().enumerate().find(|(_, d)| **d < 0) {
            return Err(OnnxError::check(
                at,
                format!("{:?} has negative dim {d} at axis {i}", init.name),
            ));
        }

        let count = init.element_count().ok_or_else(|| {
            OnnxError::check(at, format!("{:?} dims overflow: {:?}", init.name, init.dims))
        })?;

        if init.data_location == DATA_LOCATION_EXTERNAL {
            return self.check_external(init, at, count, elem);
        }

        if !init.raw_data.is_empty() {
            if let Some(width) = elem.byte_width() {
                let want = usize::try_from(count)
                    .ok()
                    .and_then(|c| c.checked_mul(width))
                    .ok_or_else(|| {
                        OnnxError::check(
                            at,
                            format!("{:?} byte size overflows: {:?} of {elem}", init.name, init.dims),
                        )
                    })?;
                if init.raw_data.len() != want {
                    return Err(OnnxError::check(
                        at,
                        format!(
                            "{:?} raw_data is {} bytes, {:?} of {elem} needs {want}",
                            init.name,
                            init.raw_data.len(),
                            init.dims
                        ),
                    ));
                }
            }
            return Ok(());
        }

        let typed = [
            init.float_data.len(),
            init.int32_data.len(),
            init.string_data.len(),
            init.int64_data.len(),
            init.double_data.len(),
            init.uint64_data.len(),
        ]
        .into_iter()
        .max()
        .unwrap_or(0);
        // Narrow types pack into int32_data and complex types take two slots.
        let one_slot_per_element = matches!(init.data_type, 1 | 6 | 7 | 11 | 12 | 13);
        if typed != 0 && one_slot_per_element && typed as i64 != count {
            return Err(OnnxError::check(
                at,
                format!(
                    "{:?} holds {typed} values, dims {:?} need {count}",
                    init.name, init.dims
                ),
            ));
        }
        Ok(())
    }

    fn check_external(
        &mut self,
        init: &TensorProto,
        at: &str,
        count: i64,
        elem: DataType,
    ) -> Result<(), OnnxError> {
        let location = init.external("location").ok_or_else(|| {
            OnnxError::check(at, format!("{:?} is external but has no location", init.name))
        })?;

        let rel = Path::new(location);
        let escapes = rel.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if location.is_empty() || escapes {
            return Err(OnnxError::check(
                at,
                format!("{:?} external location {location:?} leaves the model directory", init.name),
            ));
        }

        let file = self.base_dir.join(rel);
        let size = std::fs::metadata(&file)
            .map_err(|e| {
                OnnxError::check(
                    at,
                    format!("{:?} external file {:?}: {e}", init.name, file),
                )
            })?
            .len();

        let offset = parse_u64(init.external("offset"), at, "offset")?.unwrap_or(0);
        let length = match parse_u64(init.external("length"), at, "length")? {
            Some(l) => l,
            None => match elem.byte_width() {
                Some(w) => (count as u64).checked_mul(w as u64).ok_or_else(|| {
                    OnnxError::check(
                        at,
                        format!("{:?} byte size overflows: {:?} of {elem}", init.name, init.dims),
                    )
                })?,
                None => size.saturating_sub(offset),
            },
        };
        if offset.checked_add(length).is_none_or(|end| end > size) {
            return Err(OnnxError::check(
                at,
                format!(
                    "{:?} reads {length} bytes at offset {offset} from {location:?} ({size} bytes)",
                    init.name
                ),
            ));
        }

        self.external_files.push(location.to_string());
        Ok(())
    }
}

fn parse_u64(value: Option<&str>, at: &str, key: &str) -> Result<Option<u64>, OnnxError> {
    value
        .map(|v| {
            v.parse::<u64>()
                .map_err(|_| OnnxError::check(at, format!("external {key} {v:?} is not a number")))
        })
        .transpose()
}

fn check_value_info(info: &ValueInfoProto, at: &str) -> Result<(), OnnxError> {
    if info.name.is_empty() {
        return Err(OnnxError::check(at, "value name is empty"));
    }
    let tensor = info
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .ok_or_else(|| OnnxError::check(at, format!("{:?} has no tensor type", info.name)))?;
    if !DataType(tensor.elem_type).is_defined() {
        return Err(OnnxError::check(
            at,
            format!("{:?} has undefined element type {}", info.name, tensor.elem_type),
        ));
    }
    if let Some(shape) = &tensor.shape {
        for (i, d) in shape.dim.iter().enumerate() {
            if let Some(dimension::Value::DimValue(v)) = d.value {
                if v < 0 {
                    return Err(OnnxError::check(
                        at,
                        format!("{:?} has negative dim {v} at axis {i}", info.name),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn value_summary(info: &ValueInfoProto, at: &str) -> Result<ValueSummary, OnnxError> {
    let tensor = info
        .r#type
        .as_ref()
        .and_then(|t| t.tensor_type.as_ref())
        .ok_or_else(|| OnnxError::check(at, format!("{:?} has no tensor type", info.name)))?;
    let dims = tensor
        .shape
        .as_ref()
        .map(|s| {
            s.dim
                .iter()
                .map(|d| match &d.value {
                    Some(dimension::Value::DimValue(v)) => Dim::Fixed(*v),
                    Some(dimension::Value::DimParam(p)) if !p.is_empty() => {
                        Dim::Symbolic(p.clone())
                    }
                    _ => Dim::Unknown,
                })
                .collect()
        })
        .unwrap_or_default();
    Ok(ValueSummary {
        name: info.name.clone(),
        elem_type: DataType(tensor.elem_type),
        dims,
    })
}
