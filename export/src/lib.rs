//! Export a pretrained speech encoder to ONNX and prove the artifact works.
//!
//! # Architecture
//!
//! One run is a fixed sequence of hard gates followed by an advisory check:
//!
//! 1. [`ModelStore::load`]: model id -> local weights + encoder geometry
//! 2. [`GraphExporter::export`]: traced on a synthetic `[1, 16000]` input,
//!    written as `<name>.onnx` (+ `<name>.onnx.data`)
//! 3. [`validate_artifact`]: schema check of the file on its own
//! 4. [`verify_artifact`]: one forward pass through an independent engine,
//!    output must be `[1, 49, 768]` float32 for wav2vec2-base
//! 5. [`verify_checksums`]: SHA-256 against pinned digests
//!
//! Stages 1-4 fail with [`ExportError`]. Stage 5 never fails; it yields an
//! [`IntegrityReport`] whose mismatches are logged as warnings.
//!
//! ```text
//! 16000 samples --conv x7 (stride product 320)--> 49 frames x 768
//! ```
//!
//! [`Pipeline::smoke_test`] additionally embeds a real WAV clip (mean over
//! time) when one is present.

mod audio;
mod axes;
mod config;
mod embedding;
mod engine;
mod error;
mod exporter;
mod integrity;
mod model;
mod paths;
mod pipeline;
mod store;
mod validate;
mod verify;

pub use audio::{read_wav, AudioTensor, Clip};
pub use axes::DynamicAxes;
pub use config::{HubConfig, PipelineConfig, TracerConfig, MAX_OPSET, MIN_OPSET};
pub use embedding::{cosine_similarity, l2_norm, mean_pool};
pub use engine::{InferenceEngine, InferenceOutput, InferenceSession, OrtEngine};
pub use error::ExportError;
pub use exporter::{
    data_path_for, ensure_inference_mode, ArtifactFile, CommandExporter, ExportRequest,
    ExportedArtifact, GraphExporter,
};
pub use integrity::{
    compute_checksums, sha256_file, verify_checksums, ChecksumEntry, ChecksumStatus,
    IntegrityReport, DEFAULT_CHUNK_SIZE,
};
pub use model::{EncoderConfig, LoadedModel, ModelMode, PreprocessorConfig};
pub use paths::Paths;
pub use pipeline::{
    artifact_checksums, ExportReport, Pipeline, RunReport, SegmentSimilarity, SmokeOutcome,
    SmokeReport,
};
pub use speechport_onnx::ElementType;
pub use store::{load_from_dir, DirStore, HubStore, ModelStore};
pub use validate::{validate_artifact, ValidationSummary, ValueSignature};
pub use verify::{verify_artifact, verify_output, ExpectedOutput, Verification};
