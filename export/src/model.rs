//! A pretrained model as handed to the exporter.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Convolutional feature-extractor geometry and output width of the
/// encoder, as found in the model's `config.json`.
///
/// The defaults describe `facebook/wav2vec2-base`: seven conv layers whose
/// strides multiply to 320, producing 768-wide frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    pub model_type: String,
    pub hidden_size: usize,
    pub conv_kernel: Vec<usize>,
    pub conv_stride: Vec<usize>,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            model_type: "wav2vec2".to_string(),
            hidden_size: 768,
            conv_kernel: vec![10, 3, 3, 3, 3, 2, 2],
            conv_stride: vec![5, 2, 2, 2, 2, 2, 2],
        }
    }
}

impl EncoderConfig {
    /// Number of output frames for `samples` input samples.
    ///
    /// Each conv layer (no padding) maps a length `L` to
    /// `floor((L - kernel) / stride) + 1`; a layer whose kernel is longer
    /// than its input yields zero frames.
    pub fn frames_for(&self, samples: usize) -> usize {
        let mut len = samples;
        for (&k, &s) in self.conv_kernel.iter().zip(&self.conv_stride) {
            if len < k || s == 0 {
                return 0;
            }
            len = (len - k) / s + 1;
        }
        len
    }

    /// Product of all conv strides: input samples per output frame.
    pub fn stride_product(&self) -> usize {
        self.conv_stride.iter().product()
    }

    /// Checks that the geometry is usable.
    pub fn validate(&self) -> Result<(), String> {
        if self.hidden_size == 0 {
            return Err("hidden_size must be positive".into());
        }
        if self.conv_kernel.len() != self.conv_stride.len() {
            return Err(format!(
                "conv_kernel has {} layers but conv_stride has {}",
                self.conv_kernel.len(),
                self.conv_stride.len()
            ));
        }
        if self.conv_kernel.iter().chain(&self.conv_stride).any(|&v| v == 0) {
            return Err("conv kernels and strides must be positive".into());
        }
        Ok(())
    }
}

/// Audio preprocessing expected by the model (`preprocessor_config.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessorConfig {
    pub sampling_rate: u32,
    pub feature_size: usize,
    pub do_normalize: bool,
    pub padding_value: f32,
    pub return_attention_mask: bool,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 16000,
            feature_size: 1,
            do_normalize: true,
            padding_value: 0.0,
            return_attention_mask: false,
        }
    }
}

/// Whether training-only operators (dropout, batch statistics) are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelMode {
    Training,
    Inference,
}

/// A resolved pretrained model: its local files, architecture geometry and
/// preprocessing descriptor.
///
/// Stores hand models out in [`ModelMode::Training`]; the pipeline must call
/// [`LoadedModel::eval`] before tracing.
#[derive(Debug, Clone)]
pub struct LoadedModel {
    pub id: String,
    pub dir: PathBuf,
    pub files: Vec<PathBuf>,
    pub encoder: EncoderConfig,
    pub preprocessor: PreprocessorConfig,
    mode: ModelMode,
}

impl LoadedModel {
    pub fn new(
        id: impl Into<String>,
        dir: impl Into<PathBuf>,
        files: Vec<PathBuf>,
        encoder: EncoderConfig,
        preprocessor: PreprocessorConfig,
    ) -> Self {
        Self {
            id: id.into(),
            dir: dir.into(),
            files,
            encoder,
            preprocessor,
            mode: ModelMode::Training,
        }
    }

    /// Switches to inference mode.
    pub fn eval(&mut self) {
        self.mode = ModelMode::Inference;
    }

    pub fn mode(&self) -> ModelMode {
        self.mode
    }
}
