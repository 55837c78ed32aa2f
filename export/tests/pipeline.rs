//! End-to-end pipeline runs against stub collaborators. The stub exporter
//! writes genuine ONNX protobufs so validation and hashing see real files.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use speechport_export::{
    artifact_checksums, ensure_inference_mode, AudioTensor, ChecksumStatus, ElementType, EncoderConfig, ExportError,
    ExportRequest, ExportedArtifact, GraphExporter, InferenceEngine, InferenceOutput,
    InferenceSession, LoadedModel, ModelStore, Pipeline, PipelineConfig, PreprocessorConfig,
    SmokeOutcome,
};
use speechport_onnx::proto::{
    encode_model, tensor_shape_proto::dimension::Value, tensor_shape_proto::Dimension,
    type_proto, DataType, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto,
    DATA_LOCATION_EXTERNAL,
};

const HIDDEN: usize = 768;

// ---------------------------------------------------------------------------
// Stubs
// ---------------------------------------------------------------------------

struct StubStore;

impl ModelStore for StubStore {
    fn load(&self, id: &str) -> Result<LoadedModel, ExportError> {
        if id != "facebook/wav2vec2-base" {
            return Err(ExportError::Load {
                id: id.to_string(),
                message: "404 Not Found".into(),
            });
        }
        Ok(LoadedModel::new(
            id,
            "/stub/wav2vec2-base",
            Vec::new(),
            EncoderConfig::default(),
            PreprocessorConfig::default(),
        ))
    }
}

#[derive(Clone, Default)]
struct StubExporter {
    calls: Rc<Cell<usize>>,
    /// Bake the trace input's shape into the signature instead of symbols.
    fixed_axes: bool,
    opset_override: Option<i64>,
    fail: bool,
}

fn dim(d: &str) -> Dimension {
    Dimension {
        value: Some(match d.parse::<i64>() {
            Ok(v) => Value::DimValue(v),
            Err(_) => Value::DimParam(d.to_string()),
        }),
        ..Default::default()
    }
}

fn value(name: &str, dims: &[String]) -> ValueInfoProto {
    ValueInfoProto {
        name: name.into(),
        r#type: Some(TypeProto {
            tensor_type: Some(type_proto::Tensor {
                elem_type: DataType::FLOAT.0,
                shape: Some(TensorShapeProto {
                    dim: dims.iter().map(|d| dim(d)).collect(),
                }),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl StubExporter {
    fn write(&self, req: &ExportRequest, input: &AudioTensor) -> std::io::Result<()> {
        let [batch, samples] = input.shape();
        let (audio_dims, out_dims) = if self.fixed_axes {
            (
                vec![batch.to_string(), samples.to_string()],
                vec![batch.to_string(), "49".to_string(), HIDDEN.to_string()],
            )
        } else {
            (
                vec!["batch".to_string(), "sequence".to_string()],
                vec!["batch".to_string(), "time".to_string(), HIDDEN.to_string()],
            )
        };

        let data_name = format!(
            "{}.data",
            req.output_path.file_name().unwrap().to_string_lossy()
        );
        let weights: Vec<u8> = (0..HIDDEN)
            .flat_map(|i| (i as f32 * 0.001).to_le_bytes())
            .collect();
        std::fs::write(req.output_path.with_file_name(&data_name), &weights)?;

        let entry = |k: &str, v: String| StringStringEntryProto {
            key: k.into(),
            value: v,
        };
        let model = ModelProto {
            ir_version: 7,
            producer_name: "stub-tracer".into(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: self.opset_override.unwrap_or(req.opset_version),
            }],
            graph: Some(GraphProto {
                name: "main_graph".into(),
                input: vec![value(&req.input_name, &audio_dims)],
                output: vec![value(&req.output_name, &out_dims)],
                initializer: vec![TensorProto {
                    name: "proj.weight".into(),
                    dims: vec![1, HIDDEN as i64],
                    data_type: DataType::FLOAT.0,
                    data_location: DATA_LOCATION_EXTERNAL,
                    external_data: vec![
                        entry("location", data_name),
                        entry("offset", "0".into()),
                        entry("length", weights.len().to_string()),
                    ],
                    ..Default::default()
                }],
                node: vec![
                    NodeProto {
                        op_type: "Unsqueeze".into(),
                        name: "frames".into(),
                        input: vec![req.input_name.clone()],
                        output: vec!["frames".into()],
                        ..Default::default()
                    },
                    NodeProto {
                        op_type: "MatMul".into(),
                        name: "proj".into(),
                        input: vec!["frames".into(), "proj.weight".into()],
                        output: vec![req.output_name.clone()],
                        ..Default::default()
                    },
                ],
                ..Default::default()
            }),
            ..Default::default()
        };
        std::fs::write(&req.output_path, encode_model(&model))
    }
}

impl GraphExporter for StubExporter {
    fn export(
        &self,
        model: &LoadedModel,
        input: &AudioTensor,
        request: &ExportRequest,
    ) -> Result<ExportedArtifact, ExportError> {
        ensure_inference_mode(model)?;
        self.calls.set(self.calls.get() + 1);
        assert_eq!(input.shape(), [1, 16000]);
        if self.fail {
            return Err(ExportError::Trace("unsupported operator aten::foo".into()));
        }
        self.write(request, input)
            .map_err(|e| ExportError::Trace(e.to_string()))?;
        ExportedArtifact::discover(&request.output_path)
    }
}

/// Produces `[batch, frames_for(samples), hidden]` where each frame holds
/// the mean of its input window.
#[derive(Clone)]
struct StubEngine {
    hidden: usize,
    element_type: ElementType,
    opened: Rc<Cell<usize>>,
    runs: Rc<Cell<usize>>,
    /// Emit NaN frames once the verification run is done.
    nan_after_first_run: bool,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self {
            hidden: HIDDEN,
            element_type: ElementType::Float32,
            opened: Rc::default(),
            runs: Rc::default(),
            nan_after_first_run: false,
        }
    }
}

impl InferenceEngine for StubEngine {
    fn open(&self, path: &Path) -> Result<Box<dyn InferenceSession>, ExportError> {
        if !path.is_file() {
            return Err(ExportError::Inference(format!("no model at {path:?}")));
        }
        self.opened.set(self.opened.get() + 1);
        Ok(Box::new(self.clone()))
    }
}

impl InferenceSession for StubEngine {
    fn run(&mut self, input: &AudioTensor) -> Result<InferenceOutput, ExportError> {
        self.runs.set(self.runs.get() + 1);
        let poisoned = self.nan_after_first_run && self.runs.get() > 1;
        let encoder = EncoderConfig::default();
        let frames = encoder.frames_for(input.samples());
        let stride = encoder.stride_product();
        let mut data = Vec::with_capacity(input.batch() * frames * self.hidden);
        for row in input.data().chunks(input.samples()) {
            for t in 0..frames {
                let window = &row[(t * stride).min(row.len())..((t + 1) * stride).min(row.len())];
                let mean = if poisoned {
                    f32::NAN
                } else {
                    window.iter().sum::<f32>() / window.len().max(1) as f32
                };
                data.extend((0..self.hidden).map(|h| mean + h as f32 * 1e-3));
            }
        }
        Ok(InferenceOutput {
            shape: vec![input.batch(), frames, self.hidden],
            element_type: self.element_type.clone(),
            data,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn config(out: &Path) -> PipelineConfig {
    PipelineConfig {
        output_dir: out.join("models"),
        test_audio: out.join("test_audio.wav"),
        seed: Some(1234),
        expected_checksums: BTreeMap::new(),
        ..Default::default()
    }
}

fn pipeline(cfg: PipelineConfig, exporter: StubExporter, engine: StubEngine) -> Pipeline {
    Pipeline::new(cfg, Box::new(StubStore), Box::new(exporter), Box::new(engine)).unwrap()
}

fn write_wav(path: &Path, samples: usize) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..samples {
        let s = ((i as f32 * 0.05).sin() * 8000.0) as i16;
        writer.write_sample(s).unwrap();
    }
    writer.finalize().unwrap();
}

fn graph_and_data(cfg: &PipelineConfig) -> (PathBuf, PathBuf) {
    let graph = cfg.graph_path();
    let data = speechport_export::data_path_for(&graph);
    (graph, data)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn one_second_exports_to_49_frames_of_768() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let exporter = StubExporter::default();
    let p = pipeline(cfg.clone(), exporter.clone(), StubEngine::default());

    let report = p.export().unwrap();
    assert_eq!(exporter.calls.get(), 1);
    assert_eq!(report.model_id, "facebook/wav2vec2-base");
    assert_eq!(report.verification.input_shape, vec![1, 16000]);
    assert_eq!(report.verification.output_shape, vec![1, 49, 768]);
    assert_eq!(report.verification.dtype, "float32");
    assert_eq!(report.validation.opset_version, 14);
    assert_eq!(
        report.validation.external_files,
        vec!["wav2vec2_encoder.onnx.data".to_string()]
    );

    let (graph, data) = graph_and_data(&cfg);
    assert_eq!(report.artifact.graph.path, graph);
    assert_eq!(report.artifact.data.as_ref().unwrap().path, data);
    assert_eq!(report.artifact.data.as_ref().unwrap().bytes, 768 * 4);
    assert!(report.size_mb > 0.0);
    assert!(report.checksums_matched);
    assert!(report.integrity.entries.is_empty());
}

#[test]
fn reexport_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(config(dir.path()), StubExporter::default(), StubEngine::default());

    p.export().unwrap();
    let first = p.current_checksums().unwrap();
    p.export().unwrap();
    let second = p.current_checksums().unwrap();

    assert_eq!(first.len(), 2);
    assert_eq!(first, second);

    let pinned = PipelineConfig {
        expected_checksums: first,
        ..config(dir.path())
    };
    let report = pipeline(pinned, StubExporter::default(), StubEngine::default())
        .export()
        .unwrap();
    assert!(report.checksums_matched);
    assert!(report
        .integrity
        .entries
        .iter()
        .all(|e| e.status == ChecksumStatus::Ok));
}

#[test]
fn checksums_need_no_engine() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    assert!(matches!(artifact_checksums(&cfg), Err(ExportError::Io { .. })));

    let p = pipeline(cfg.clone(), StubExporter::default(), StubEngine::default());
    p.export().unwrap();
    let table = artifact_checksums(&cfg).unwrap();
    assert_eq!(table, p.current_checksums().unwrap());
    assert_eq!(
        table.keys().map(String::as_str).collect::<Vec<_>>(),
        ["wav2vec2_encoder.onnx", "wav2vec2_encoder.onnx.data"]
    );
    assert!(table.values().all(|d| d.len() == 64));
}

#[test]
fn missing_checksum_target_is_reported_not_raised() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.expected_checksums
        .insert("not_exported.onnx".into(), "00".repeat(32));

    let report = pipeline(cfg, StubExporter::default(), StubEngine::default())
        .export()
        .unwrap();
    assert!(!report.checksums_matched);
    let entry = report.integrity.get("not_exported.onnx").unwrap();
    assert_eq!(entry.status, ChecksumStatus::Missing);
    assert_eq!(entry.status.to_string(), "MISSING");
}

#[test]
fn corrupted_artifact_is_a_mismatch_not_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let p = pipeline(config(dir.path()), StubExporter::default(), StubEngine::default());
    p.export().unwrap();
    let pinned = p.current_checksums().unwrap();

    let cfg = PipelineConfig {
        expected_checksums: pinned.clone(),
        ..config(dir.path())
    };
    let (_, data) = graph_and_data(&cfg);
    let mut bytes = std::fs::read(&data).unwrap();
    bytes[100] ^= 0xff;
    std::fs::write(&data, &bytes).unwrap();

    let report = pipeline(cfg, StubExporter::default(), StubEngine::default())
        .verify_existing()
        .unwrap();
    assert!(!report.checksums_matched);
    assert_eq!(
        report.integrity.get("wav2vec2_encoder.onnx").unwrap().status,
        ChecksumStatus::Ok
    );
    match &report.integrity.get("wav2vec2_encoder.onnx.data").unwrap().status {
        ChecksumStatus::Mismatch { actual } => {
            assert_ne!(actual, &pinned["wav2vec2_encoder.onnx.data"]);
        }
        other => panic!("expected mismatch, got {other:?}"),
    }
}

#[test]
fn wrong_hidden_size_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StubEngine {
        hidden: 512,
        ..Default::default()
    };
    let err = pipeline(config(dir.path()), StubExporter::default(), engine)
        .export()
        .unwrap_err();
    assert!(matches!(err, ExportError::Shape(_)), "{err}");
}

#[test]
fn wrong_dtype_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StubEngine {
        element_type: ElementType::Float16,
        ..Default::default()
    };
    let err = pipeline(config(dir.path()), StubExporter::default(), engine)
        .export()
        .unwrap_err();
    assert!(matches!(err, ExportError::DType { .. }), "{err}");
}

#[test]
fn trace_failure_stops_the_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StubEngine::default();
    let exporter = StubExporter {
        fail: true,
        ..Default::default()
    };
    let err = pipeline(config(dir.path()), exporter, engine.clone())
        .export()
        .unwrap_err();
    assert!(matches!(err, ExportError::Trace(_)));
    assert_eq!(engine.opened.get(), 0);
}

#[test]
fn unknown_model_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        model_id: "nobody/nothing".into(),
        ..config(dir.path())
    };
    let exporter = StubExporter::default();
    let err = pipeline(cfg, exporter.clone(), StubEngine::default())
        .export()
        .unwrap_err();
    assert!(matches!(err, ExportError::Load { .. }));
    assert_eq!(exporter.calls.get(), 0);
}

#[test]
fn frozen_dynamic_axes_fail_validation() {
    let dir = tempfile::tempdir().unwrap();
    let engine = StubEngine::default();
    let exporter = StubExporter {
        fixed_axes: true,
        ..Default::default()
    };
    let err = pipeline(config(dir.path()), exporter, engine.clone())
        .export()
        .unwrap_err();
    assert!(matches!(err, ExportError::Validation(_)), "{err}");
    assert_eq!(engine.opened.get(), 0);
}

#[test]
fn opset_drift_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let exporter = StubExporter {
        opset_override: Some(17),
        ..Default::default()
    };
    let err = pipeline(config(dir.path()), exporter, StubEngine::default())
        .export()
        .unwrap_err();
    assert!(err.to_string().contains("opset 17"), "{err}");
}

#[test]
fn verify_existing_needs_an_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let err = pipeline(config(dir.path()), StubExporter::default(), StubEngine::default())
        .verify_existing()
        .unwrap_err();
    assert!(matches!(err, ExportError::Io { .. }));
}

#[test]
fn smoke_without_audio_is_a_notice() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    let exporter = StubExporter::default();
    let p = pipeline(cfg.clone(), exporter.clone(), StubEngine::default());

    let outcome = p.smoke_test().unwrap();
    assert_eq!(exporter.calls.get(), 1, "missing artifact triggers an export");
    assert_eq!(
        outcome,
        SmokeOutcome::NoAudio {
            path: cfg.test_audio.clone()
        }
    );

    p.smoke_test().unwrap();
    assert_eq!(exporter.calls.get(), 1, "existing artifact is reused");
}

#[test]
fn smoke_embeds_a_real_clip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_wav(&cfg.test_audio, 32000);
    let engine = StubEngine::default();
    let p = pipeline(cfg.clone(), StubExporter::default(), engine.clone());

    let report = p.run().unwrap();
    let smoke = match report.smoke {
        SmokeOutcome::Embedded(smoke) => smoke,
        other => panic!("expected an embedding, got {other:?}"),
    };
    assert_eq!(smoke.sample_rate, 16000);
    assert!((smoke.duration_secs - 2.0).abs() < 1e-9);
    assert_eq!(smoke.output_shape, vec![1, 99, 768]);
    assert_eq!(smoke.embedding_dim, 768);
    assert!(smoke.embedding_norm > 0.0);
    assert!(smoke.embedding_finite);
    // verification and smoke test each open their own session
    assert_eq!(engine.opened.get(), 2);

    // a two-second clip has no strictly shorter two-second segment
    let names: Vec<&str> = smoke.segments.iter().map(|s| s.segment.as_str()).collect();
    assert_eq!(names, ["first_1s", "middle_1s"]);
    assert!((smoke.segments[1].start_secs - 0.5).abs() < 1e-9);
    // verification, full clip, two segments
    assert_eq!(engine.runs.get(), 4);
}

#[test]
fn smoke_compares_segments_against_the_full_clip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_wav(&cfg.test_audio, 48000);
    let p = pipeline(cfg, StubExporter::default(), StubEngine::default());

    let smoke = match p.smoke_test().unwrap() {
        SmokeOutcome::Embedded(smoke) => smoke,
        other => panic!("expected an embedding, got {other:?}"),
    };
    assert_eq!(smoke.output_shape, vec![1, 149, 768]);
    let names: Vec<&str> = smoke.segments.iter().map(|s| s.segment.as_str()).collect();
    assert_eq!(names, ["first_1s", "first_2s", "middle_1s"]);
    assert_eq!(smoke.segments[0].duration_secs, 1.0);
    assert_eq!(smoke.segments[1].duration_secs, 2.0);
    assert!((smoke.segments[2].start_secs - 1.0).abs() < 1e-9);
    for seg in &smoke.segments {
        assert!(
            seg.similarity > 0.9 && seg.similarity <= 1.0,
            "{}: {}",
            seg.segment,
            seg.similarity
        );
    }
}

#[test]
fn smoke_flags_non_finite_embedding() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_wav(&cfg.test_audio, 48000);
    let engine = StubEngine {
        nan_after_first_run: true,
        ..Default::default()
    };
    let p = pipeline(cfg, StubExporter::default(), engine.clone());

    let smoke = match p.run().unwrap().smoke {
        SmokeOutcome::Embedded(smoke) => smoke,
        other => panic!("expected an embedding, got {other:?}"),
    };
    assert!(!smoke.embedding_finite);
    assert!(smoke.embedding_norm.is_nan());
    assert!(smoke.segments.is_empty());
    // no segment runs after a non-finite full-clip embedding
    assert_eq!(engine.runs.get(), 2);
}

#[test]
fn smoke_rejects_too_short_clip() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = config(dir.path());
    write_wav(&cfg.test_audio, 100);
    let p = pipeline(cfg, StubExporter::default(), StubEngine::default());
    p.export().unwrap();
    assert!(matches!(p.smoke_test(), Err(ExportError::Audio { .. })));
}

#[test]
fn invalid_config_is_rejected_up_front() {
    let cfg = PipelineConfig {
        opset_version: 3,
        ..Default::default()
    };
    let result = Pipeline::new(
        cfg,
        Box::new(StubStore),
        Box::new(StubExporter::default()),
        Box::new(StubEngine::default()),
    );
    assert!(matches!(result, Err(ExportError::Config(_))));
}

#[test]
#[ignore = "requires the speechport-trace tool, network access and ONNX Runtime"]
fn standard_pipeline_exports_wav2vec2_base() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = PipelineConfig {
        output_dir: dir.path().join("models"),
        ..Default::default()
    };
    let report = Pipeline::standard(cfg).unwrap().export().unwrap();
    assert_eq!(report.verification.output_shape, vec![1, 49, 768]);
}
