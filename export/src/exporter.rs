//! Graph export: turning a loaded model into an ONNX artifact on disk.

use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use serde::Serialize;
use tracing::{debug, info};

use crate::audio::AudioTensor;
use crate::axes::DynamicAxes;
use crate::config::TracerConfig;
use crate::error::ExportError;
use crate::model::{LoadedModel, ModelMode};

/// What to trace and where to write it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRequest {
    pub input_name: String,
    pub output_name: String,
    pub opset_version: i64,
    pub dynamic_axes: DynamicAxes,
    pub output_path: PathBuf,
}

/// One file of an exported artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactFile {
    pub path: PathBuf,
    pub bytes: u64,
}

impl ArtifactFile {
    fn stat(path: PathBuf) -> Result<Self, ExportError> {
        let meta = std::fs::metadata(&path).map_err(|e| ExportError::io(&path, e))?;
        Ok(Self {
            path,
            bytes: meta.len(),
        })
    }

    /// File name without its directory.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// The graph file plus its external weight file, when the graph was too
/// large to embed its weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedArtifact {
    pub graph: ArtifactFile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ArtifactFile>,
}

impl ExportedArtifact {
    /// Inspects `<graph>` and its sibling `<graph>.data` on disk.
    pub fn discover(graph_path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let graph_path = graph_path.as_ref();
        let graph = ArtifactFile::stat(graph_path.to_path_buf())?;
        let data_path = data_path_for(graph_path);
        let data = if data_path.is_file() {
            Some(ArtifactFile::stat(data_path)?)
        } else {
            None
        };
        Ok(Self { graph, data })
    }

    pub fn files(&self) -> impl Iterator<Item = &ArtifactFile> {
        std::iter::once(&self.graph).chain(self.data.as_ref())
    }

    pub fn total_bytes(&self) -> u64 {
        self.files().map(|f| f.bytes).sum()
    }

    /// Size in MB (10^6 bytes) across all files.
    pub fn size_mb(&self) -> f64 {
        self.total_bytes() as f64 / 1e6
    }
}

/// `<graph>.data`
pub fn data_path_for(graph_path: &Path) -> PathBuf {
    let mut name = graph_path.as_os_str().to_os_string();
    name.push(".data");
    PathBuf::from(name)
}

/// Traces a model on a synthetic input and serializes the graph.
pub trait GraphExporter {
    fn export(
        &self,
        model: &LoadedModel,
        input: &AudioTensor,
        request: &ExportRequest,
    ) -> Result<ExportedArtifact, ExportError>;
}

/// Fails unless the model has been switched to inference mode.
pub fn ensure_inference_mode(model: &LoadedModel) -> Result<(), ExportError> {
    match model.mode() {
        ModelMode::Inference => Ok(()),
        ModelMode::Training => Err(ExportError::TrainingMode(model.id.clone())),
    }
}

#[derive(Serialize)]
struct TraceJob<'a> {
    model_id: &'a str,
    model_dir: &'a Path,
    model_files: &'a [PathBuf],
    input_shape: [usize; 2],
    input: &'a [f32],
    #[serde(flatten)]
    request: &'a ExportRequest,
}

/// Delegates tracing to an external program.
///
/// The program receives one JSON object on stdin describing the model,
/// the synthetic input and the [`ExportRequest`], and must write the graph
/// to `output_path`. A non-zero exit aborts the export. Partial files are
/// left as they are.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    tracer: TracerConfig,
}

impl CommandExporter {
    pub fn new(tracer: TracerConfig) -> Self {
        Self { tracer }
    }
}

impl GraphExporter for CommandExporter {
    fn export(
        &self,
        model: &LoadedModel,
        input: &AudioTensor,
        request: &ExportRequest,
    ) -> Result<ExportedArtifact, ExportError> {
        ensure_inference_mode(model)?;

        let job = TraceJob {
            model_id: &model.id,
            model_dir: &model.dir,
            model_files: &model.files,
            input_shape: input.shape(),
            input: input.data(),
            request,
        };
        let payload =
            serde_json::to_vec(&job).map_err(|e| ExportError::Trace(format!("encode job: {e}")))?;

        info!(
            program = %self.tracer.program,
            opset = request.opset_version,
            "Exporting to {}...",
            request.output_path.display()
        );
        let mut child = Command::new(&self.tracer.program)
            .args(&self.tracer.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ExportError::Trace(format!("spawn {:?}: {e}", self.tracer.program)))?;

        let stdin = child.stdin.take();
        let writer = std::thread::spawn(move || -> io::Result<()> {
            match stdin {
                Some(mut stdin) => stdin.write_all(&payload),
                None => Ok(()),
            }
        });

        let output = child
            .wait_with_output()
            .map_err(|e| ExportError::Trace(format!("wait {:?}: {e}", self.tracer.program)))?;
        let written = writer
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("stdin writer panicked")));

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!(tracer_stdout = %stdout.trim_end());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ExportError::Trace(format!(
                "{} exited with {}: {}",
                self.tracer.program,
                output.status,
                stderr.trim()
            )));
        }
        match written {
            Err(e) if e.kind() != io::ErrorKind::BrokenPipe => {
                return Err(ExportError::Trace(format!("write job: {e}")));
            }
            _ => {}
        }
        if !request.output_path.is_file() {
            return Err(ExportError::Trace(format!(
                "{} succeeded but wrote no graph at {}",
                self.tracer.program,
                request.output_path.display()
            )));
        }
        ExportedArtifact::discover(&request.output_path)
    }
}
