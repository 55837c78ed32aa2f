//! The export → validate → verify → checksum sequence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::audio::{read_wav, AudioTensor};
use crate::config::PipelineConfig;
use crate::embedding::{cosine_similarity, l2_norm, mean_pool};
use crate::engine::{InferenceEngine, InferenceSession, OrtEngine};
use crate::error::ExportError;
use crate::exporter::{ensure_inference_mode, CommandExporter, ExportedArtifact, GraphExporter};
use crate::integrity::{compute_checksums, verify_checksums, IntegrityReport};
use crate::model::EncoderConfig;
use crate::store::{HubStore, ModelStore};
use crate::validate::{validate_artifact, ValidationSummary};
use crate::verify::{verify_artifact, ExpectedOutput, Verification};

/// Outcome of a successful export or re-verification.
#[derive(Debug, Clone, Serialize)]
pub struct ExportReport {
    pub model_id: String,
    pub artifact: ExportedArtifact,
    pub size_mb: f64,
    pub validation: ValidationSummary,
    pub verification: Verification,
    pub checksums_matched: bool,
    pub integrity: IntegrityReport,
}

/// Observations from running a real clip through the encoder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SmokeReport {
    pub audio_path: PathBuf,
    pub sample_rate: u32,
    pub duration_secs: f64,
    pub output_shape: Vec<usize>,
    pub embedding_dim: usize,
    pub embedding_norm: f32,
    /// False when the pooled embedding holds NaN or Inf.
    pub embedding_finite: bool,
    /// Sub-clip embeddings compared against the full clip. Only segments
    /// strictly shorter than the clip are listed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub segments: Vec<SegmentSimilarity>,
}

/// Cosine similarity between a sub-clip's embedding and the full clip's.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentSimilarity {
    pub segment: String,
    pub start_secs: f64,
    pub duration_secs: f64,
    pub similarity: f32,
}

/// The smoke test is diagnostic. A missing clip is a notice, not a failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SmokeOutcome {
    NoAudio { path: PathBuf },
    Embedded(SmokeReport),
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub export: ExportReport,
    pub smoke: SmokeOutcome,
}

/// Runs the pipeline stages against pluggable collaborators.
pub struct Pipeline {
    config: PipelineConfig,
    store: Box<dyn ModelStore>,
    exporter: Box<dyn GraphExporter>,
    engine: Box<dyn InferenceEngine>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Box<dyn ModelStore>,
        exporter: Box<dyn GraphExporter>,
        engine: Box<dyn InferenceEngine>,
    ) -> Result<Self, ExportError> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            exporter,
            engine,
        })
    }

    /// Hub download, external tracer and ONNX Runtime.
    pub fn standard(config: PipelineConfig) -> Result<Self, ExportError> {
        let store = HubStore::new(&config.hub)?;
        let exporter = CommandExporter::new(config.tracer.clone());
        let engine = OrtEngine::new(&config.input_name, &config.output_name, config.intra_threads)?;
        Self::new(config, Box::new(store), Box::new(exporter), Box::new(engine))
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Loads the model, exports it, then validates, verifies and checksums
    /// the new artifact. Overwrites any previous artifact.
    pub fn export(&self) -> Result<ExportReport, ExportError> {
        let cfg = &self.config;

        info!("Loading {}...", cfg.model_id);
        let mut model = self.store.load(&cfg.model_id)?;
        model.eval();
        ensure_inference_mode(&model)?;
        if model.preprocessor.sampling_rate != cfg.sample_rate {
            warn!(
                "model expects {} Hz audio but the pipeline is configured for {} Hz",
                model.preprocessor.sampling_rate, cfg.sample_rate
            );
        }

        std::fs::create_dir_all(&cfg.output_dir)
            .map_err(|e| ExportError::io(&cfg.output_dir, e))?;

        let trace_input = AudioTensor::synthetic(cfg.batch_size, cfg.trace_samples, cfg.seed);
        let request = cfg.export_request();
        debug!(dynamic_axes = ?request.dynamic_axes, "export request");
        let artifact = self.exporter.export(&model, &trace_input, &request)?;

        self.check_artifact(artifact, &model.encoder)
    }

    /// Validates, verifies and checksums the artifact already on disk.
    pub fn verify_existing(&self) -> Result<ExportReport, ExportError> {
        let artifact = ExportedArtifact::discover(self.config.graph_path())?;
        self.check_artifact(artifact, &self.config.encoder)
    }

    fn check_artifact(
        &self,
        artifact: ExportedArtifact,
        encoder: &EncoderConfig,
    ) -> Result<ExportReport, ExportError> {
        let cfg = &self.config;
        let graph_path = artifact.graph.path.clone();

        let validation = validate_artifact(&graph_path, &cfg.export_request())?;

        let test_seed = cfg.seed.map(|s| s.wrapping_add(1));
        let input = AudioTensor::synthetic(cfg.batch_size, cfg.trace_samples, test_seed);
        let expected = ExpectedOutput::for_input(encoder, &input, cfg.frame_tolerance);
        let verification = verify_artifact(self.engine.as_ref(), &graph_path, &input, &expected)?;

        info!("Model size: {:.1} MB", artifact.size_mb());

        let integrity =
            verify_checksums(&cfg.output_dir, &cfg.expected_checksums, cfg.hash_chunk_size);
        integrity.log();

        Ok(ExportReport {
            model_id: cfg.model_id.clone(),
            size_mb: artifact.size_mb(),
            artifact,
            validation,
            verification,
            checksums_matched: integrity.all_matched(),
            integrity,
        })
    }

    /// Embeds the configured test clip, exporting first if needed.
    pub fn smoke_test(&self) -> Result<SmokeOutcome, ExportError> {
        let cfg = &self.config;
        let graph_path = cfg.graph_path();
        if !graph_path.is_file() {
            info!("Model not found, exporting first...");
            self.export()?;
        }

        if !cfg.test_audio.is_file() {
            info!("No test audio found at {}", cfg.test_audio.display());
            return Ok(SmokeOutcome::NoAudio {
                path: cfg.test_audio.clone(),
            });
        }
        self.embed_clip(&graph_path, &cfg.test_audio)
            .map(SmokeOutcome::Embedded)
    }

    fn embed_clip(&self, graph_path: &Path, audio_path: &Path) -> Result<SmokeReport, ExportError> {
        let cfg = &self.config;
        let clip = read_wav(audio_path)?;
        info!(
            "Loaded {}: {} samples at {} Hz ({:.2}s)",
            audio_path.display(),
            clip.samples.len(),
            clip.sample_rate,
            clip.duration_secs()
        );
        if clip.sample_rate != cfg.sample_rate {
            warn!(
                "clip is {} Hz, encoder expects {} Hz; embedding will be off",
                clip.sample_rate, cfg.sample_rate
            );
        }
        if cfg.encoder.frames_for(clip.samples.len()) == 0 {
            return Err(ExportError::Audio {
                path: audio_path.to_path_buf(),
                message: format!("{} samples is too short to encode", clip.samples.len()),
            });
        }

        let mut session = self.engine.open(graph_path)?;
        let (output_shape, embedding) = embed(session.as_mut(), &clip.samples)?;
        let norm = l2_norm(&embedding);
        info!(
            "Output shape: {:?}, embedding dim: {}, norm: {norm:.4}",
            output_shape,
            embedding.len()
        );

        let finite = embedding.iter().all(|x| x.is_finite());
        let segments = if finite {
            self.segment_similarities(session.as_mut(), &clip.samples, &embedding)?
        } else {
            warn!("embedding of {} contains NaN/Inf", audio_path.display());
            Vec::new()
        };

        Ok(SmokeReport {
            audio_path: audio_path.to_path_buf(),
            sample_rate: clip.sample_rate,
            duration_secs: clip.duration_secs(),
            output_shape,
            embedding_dim: embedding.len(),
            embedding_norm: norm,
            embedding_finite: finite,
            segments,
        })
    }

    /// First 1s, first 2s and middle 1s against the full clip. Observational
    /// only; no similarity is required.
    fn segment_similarities(
        &self,
        session: &mut dyn InferenceSession,
        samples: &[f32],
        full: &[f32],
    ) -> Result<Vec<SegmentSimilarity>, ExportError> {
        let rate = self.config.sample_rate as usize;
        let len = samples.len();
        let windows = [
            ("first_1s", 0, rate),
            ("first_2s", 0, 2 * rate),
            ("middle_1s", (len / 2).saturating_sub(rate / 2), rate),
        ];

        let mut out = Vec::new();
        for (name, start, width) in windows {
            let end = start + width;
            if width >= len || end > len || self.config.encoder.frames_for(width) == 0 {
                debug!("skip segment {name}: clip has {len} samples");
                continue;
            }
            let (_, embedding) = embed(session, &samples[start..end])?;
            let similarity = cosine_similarity(&embedding, full);
            info!("{name} vs full: {similarity:.4}");
            out.push(SegmentSimilarity {
                segment: name.to_string(),
                start_secs: start as f64 / rate as f64,
                duration_secs: width as f64 / rate as f64,
                similarity,
            });
        }
        Ok(out)
    }

    /// Export followed by the smoke test.
    pub fn run(&self) -> Result<RunReport, ExportError> {
        let export = self.export()?;
        let smoke = self.smoke_test()?;
        Ok(RunReport { export, smoke })
    }

    /// Digests of the artifact currently on disk, keyed by file name.
    pub fn current_checksums(&self) -> Result<BTreeMap<String, String>, ExportError> {
        artifact_checksums(&self.config)
    }
}

/// Digests of the artifact `cfg` points at, keyed by file name. Needs no
/// model store or inference runtime.
pub fn artifact_checksums(cfg: &PipelineConfig) -> Result<BTreeMap<String, String>, ExportError> {
    let artifact = ExportedArtifact::discover(cfg.graph_path())?;
    compute_checksums(artifact.files().map(|f| f.path.as_path()), cfg.hash_chunk_size)
        .map_err(|e| ExportError::io(&artifact.graph.path, e))
}

/// Runs one clip through `session` and mean-pools the frames.
fn embed(
    session: &mut dyn InferenceSession,
    samples: &[f32],
) -> Result<(Vec<usize>, Vec<f32>), ExportError> {
    let output = session.run(&AudioTensor::from_samples(samples))?;
    let embedding = mean_pool(&output)?;
    Ok((output.shape, embedding))
}
