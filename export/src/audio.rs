//! Encoder inputs: synthetic noise for tracing, real clips for the smoke test.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::error::ExportError;

/// Full-scale value of 16-bit PCM.
const PCM16_SCALE: f32 = 32768.0;

/// A `[batch, samples]` block of f32 audio, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTensor {
    shape: [usize; 2],
    data: Vec<f32>,
}

impl AudioTensor {
    /// Standard-normal samples. A seed makes the draw reproducible.
    pub fn synthetic(batch: usize, samples: usize, seed: Option<u64>) -> Self {
        let mut rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let data = (0..batch * samples)
            .map(|_| rng.sample::<f32, _>(StandardNormal))
            .collect();
        Self {
            shape: [batch, samples],
            data,
        }
    }

    pub fn zeros(batch: usize, samples: usize) -> Self {
        Self {
            shape: [batch, samples],
            data: vec![0.0; batch * samples],
        }
    }

    /// Mono samples as a single-row batch, `[1, n]`.
    pub fn from_samples(samples: &[f32]) -> Self {
        Self {
            shape: [1, samples.len()],
            data: samples.to_vec(),
        }
    }

    pub fn batch(&self) -> usize {
        self.shape[0]
    }

    pub fn samples(&self) -> usize {
        self.shape[1]
    }

    pub fn shape(&self) -> [usize; 2] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }
}

/// Mono audio decoded from a WAV file, samples in [-1.0, 1.0).
#[derive(Debug, Clone, PartialEq)]
pub struct Clip {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl Clip {
    /// Length in seconds.
    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Reads a 16-bit integer PCM WAV file. Multi-channel audio is averaged
/// down to mono.
pub fn read_wav(path: impl AsRef<Path>) -> Result<Clip, ExportError> {
    let path = path.as_ref();
    let fail = |message: String| ExportError::Audio {
        path: path.to_path_buf(),
        message,
    };

    let mut reader = hound::WavReader::open(path).map_err(|e| fail(e.to_string()))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(fail(format!(
            "expected 16-bit integer PCM, got {}-bit {:?}",
            spec.bits_per_sample, spec.sample_format
        )));
    }
    let channels = usize::from(spec.channels.max(1));

    let raw = reader
        .samples::<i16>()
        .map(|s| s.map(|v| f32::from(v) / PCM16_SCALE))
        .collect::<Result<Vec<f32>, _>>()
        .map_err(|e| fail(e.to_string()))?;

    let samples = if channels == 1 {
        raw
    } else {
        raw.chunks_exact(channels)
            .map(|frame| frame.iter().sum::<f32>() / channels as f32)
            .collect()
    };

    Ok(Clip {
        sample_rate: spec.sample_rate,
        samples,
    })
}
