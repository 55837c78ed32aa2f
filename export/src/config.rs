//! Pipeline configuration.
//!
//! Every value the export run depends on lives in [`PipelineConfig`]. The
//! `Default` impl is the stock wav2vec2-base export; a YAML file may
//! override any subset of keys.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::axes::DynamicAxes;
use crate::error::ExportError;
use crate::exporter::ExportRequest;
use crate::integrity::DEFAULT_CHUNK_SIZE;
use crate::model::EncoderConfig;

/// Oldest opset the exporter may be asked for.
pub const MIN_OPSET: i64 = 7;
/// Newest opset the exporter may be asked for.
pub const MAX_OPSET: i64 = speechport_onnx::checker::MAX_OPSET;

/// Pinned digests of a known-good wav2vec2-base export. These drift across
/// tracer and framework versions, so a mismatch is only a warning.
const PINNED_CHECKSUMS: [(&str, &str); 2] = [
    (
        "wav2vec2_encoder.onnx",
        "c7c1889bdbad143221dead8137d067b092fa3adb891c76a64d26d3dcb3c41b60",
    ),
    (
        "wav2vec2_encoder.onnx.data",
        "836b7752b6f486fb53c0c16a09342859f24d7a89d4a4eccb1818a7d31c467f27",
    ),
];

/// Configuration for one export run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Pretrained model identifier, e.g. `facebook/wav2vec2-base`.
    pub model_id: String,

    /// Directory receiving `<artifact_name>.onnx` and its `.data` sibling.
    pub output_dir: PathBuf,

    /// Artifact base name.
    pub artifact_name: String,

    /// Operator-set version pinned into the exported graph.
    pub opset_version: i64,

    /// Graph input name (audio samples).
    pub input_name: String,

    /// Graph output name (encoder frames).
    pub output_name: String,

    /// Sample rate the encoder expects, in Hz.
    pub sample_rate: u32,

    /// Samples in the synthetic trace/test input (one second by default).
    pub trace_samples: usize,

    /// Batch size of the synthetic input.
    pub batch_size: usize,

    /// Allowed difference between observed and expected output frames.
    pub frame_tolerance: usize,

    /// Encoder geometry used when no model has been loaded in this run.
    pub encoder: EncoderConfig,

    /// Read size for checksum streaming.
    pub hash_chunk_size: usize,

    /// Seed for synthetic inputs. Unset draws from OS entropy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Intra-op threads for inference sessions (0 = runtime default).
    pub intra_threads: usize,

    /// Optional real clip for the embedding smoke test.
    pub test_audio: PathBuf,

    /// Expected SHA-256 per artifact file name.
    pub expected_checksums: BTreeMap<String, String>,

    pub tracer: TracerConfig,

    pub hub: HubConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_id: "facebook/wav2vec2-base".to_string(),
            output_dir: PathBuf::from("models"),
            artifact_name: "wav2vec2_encoder".to_string(),
            opset_version: 14,
            input_name: "audio".to_string(),
            output_name: "last_hidden_state".to_string(),
            sample_rate: 16000,
            trace_samples: 16000,
            batch_size: 1,
            frame_tolerance: 0,
            encoder: EncoderConfig::default(),
            hash_chunk_size: DEFAULT_CHUNK_SIZE,
            seed: None,
            intra_threads: 4,
            test_audio: PathBuf::from("test_audio.wav"),
            expected_checksums: PINNED_CHECKSUMS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tracer: TracerConfig::default(),
            hub: HubConfig::default(),
        }
    }
}

/// External program that traces the framework model into ONNX.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    pub program: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            program: "speechport-trace".to_string(),
            args: Vec::new(),
        }
    }
}

/// Where pretrained models are fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Hub base URL.
    pub endpoint: String,

    /// Branch, tag or commit to resolve files at.
    pub revision: String,

    /// Files fetched for every model.
    pub files: Vec<String>,

    /// Local cache (default `~/.speechport/export/cache/hub`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_dir: Option<PathBuf>,

    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            revision: "main".to_string(),
            files: vec![
                "config.json".to_string(),
                "preprocessor_config.json".to_string(),
                "pytorch_model.bin".to_string(),
            ],
            cache_dir: None,
            timeout_secs: 600,
        }
    }
}

impl PipelineConfig {
    /// Loads a YAML config file. Keys absent from the file keep defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ExportError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ExportError::io(path, e))?;
        let cfg: PipelineConfig = serde_yaml::from_str(&content)
            .map_err(|e| ExportError::Config(format!("parse {path:?}: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ExportError> {
        let fail = |msg: String| Err(ExportError::Config(msg));
        if self.model_id.trim().is_empty() {
            return fail("model_id is empty".into());
        }
        if self.artifact_name.trim().is_empty() {
            return fail("artifact_name is empty".into());
        }
        if self.input_name.is_empty() || self.output_name.is_empty() {
            return fail("input_name and output_name must be set".into());
        }
        if self.input_name == self.output_name {
            return fail(format!(
                "input and output share the name {:?}",
                self.input_name
            ));
        }
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset_version) {
            return fail(format!(
                "opset_version {} outside {MIN_OPSET}..={MAX_OPSET}",
                self.opset_version
            ));
        }
        if self.sample_rate == 0 || self.trace_samples == 0 || self.batch_size == 0 {
            return fail("sample_rate, trace_samples and batch_size must be positive".into());
        }
        if self.hash_chunk_size == 0 {
            return fail("hash_chunk_size must be positive".into());
        }
        if self.tracer.program.trim().is_empty() {
            return fail("tracer.program is empty".into());
        }
        self.encoder.validate().map_err(ExportError::Config)?;
        if self.encoder.frames_for(self.trace_samples) == 0 {
            return fail(format!(
                "trace_samples {} is shorter than the encoder's receptive field",
                self.trace_samples
            ));
        }
        Ok(())
    }

    /// Path of the graph file, `<output_dir>/<artifact_name>.onnx`.
    pub fn graph_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.onnx", self.artifact_name))
    }

    /// Dynamic axes: batch and length on the input, batch and time on the output.
    pub fn dynamic_axes(&self) -> DynamicAxes {
        DynamicAxes::encoder(&self.input_name, &self.output_name)
    }

    /// The export request this config describes.
    pub fn export_request(&self) -> ExportRequest {
        ExportRequest {
            input_name: self.input_name.clone(),
            output_name: self.output_name.clone(),
            opset_version: self.opset_version,
            dynamic_axes: self.dynamic_axes(),
            output_path: self.graph_path(),
        }
    }
}
