//! Clip embeddings from encoder frames.
//!
//! Accumulation runs in f64.

use crate::engine::InferenceOutput;
use crate::error::ExportError;

/// Norms at or below this are treated as zero.
const NORM_EPSILON: f64 = 1e-8;

/// Averages a `[1, T, D]` output over T into one D-wide vector.
pub fn mean_pool(output: &InferenceOutput) -> Result<Vec<f32>, ExportError> {
    let &[batch, frames, dim] = output.shape.as_slice() else {
        return Err(ExportError::Shape(format!(
            "mean pooling needs [1, time, hidden], got {:?}",
            output.shape
        )));
    };
    if batch != 1 || frames == 0 || dim == 0 {
        return Err(ExportError::Shape(format!(
            "mean pooling needs one non-empty clip, got {:?}",
            output.shape
        )));
    }
    if output.data.len() != frames * dim {
        return Err(ExportError::Shape(format!(
            "{} values for shape {:?}",
            output.data.len(),
            output.shape
        )));
    }

    let mut sum = vec![0f64; dim];
    for frame in output.data.chunks_exact(dim) {
        for (acc, &x) in sum.iter_mut().zip(frame) {
            *acc += x as f64;
        }
    }
    Ok(sum.into_iter().map(|s| (s / frames as f64) as f32).collect())
}

/// Euclidean norm.
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter()
        .map(|&x| (x as f64) * (x as f64))
        .sum::<f64>()
        .sqrt() as f32
}

/// Cosine similarity in [-1, 1]. Returns 0.0 for empty or mismatched
/// vectors and when either vector is (near) zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0f64, 0f64, 0f64);
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let (norm_a, norm_b) = (norm_a.sqrt(), norm_b.sqrt());
    if norm_a <= NORM_EPSILON || norm_b <= NORM_EPSILON {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0) as f32
}
