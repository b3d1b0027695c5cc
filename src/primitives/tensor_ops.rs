//! Core Tensor Operations
//!
//! Device selection plus the numerical building blocks of the learner:
//! guarded L2 normalisation, squared Euclidean distances and the two losses
//! used by the session training loop.
//!
//! ## Device Selection
//!
//! Set `AN_ICARL_NO_GPU=1` to force CPU mode. Otherwise [`best_device`] picks
//! Metal, then CUDA (when the matching cargo feature is enabled), then CPU.

use crate::{IcarlError, Result};
use candle_core::{Device, Tensor};
use tracing::info;

/// Norms at or below this value are treated as degenerate embeddings.
pub const NORM_EPS: f32 = 1e-12;

// ============================================================================
// Environment-controlled Device Selection
// ============================================================================

/// Check if GPU is disabled via environment variable.
pub fn gpu_disabled() -> bool {
    std::env::var("AN_ICARL_NO_GPU")
        .map(|v| !v.is_empty() && v != "0" && v.to_lowercase() != "false")
        .unwrap_or(false)
}

/// Get the best available device for tensor operations
///
/// Priority:
/// 1. Check `AN_ICARL_NO_GPU` env var (forces CPU if set)
/// 2. Metal (Apple Silicon)
/// 3. CUDA (NVIDIA GPUs)
/// 4. CPU (fallback)
pub fn best_device() -> Device {
    if gpu_disabled() {
        info!("💻 Using CPU device (AN_ICARL_NO_GPU set)");
        return Device::Cpu;
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(0) {
            info!("🍎 Using Metal device (Apple Silicon)");
            return device;
        }
    }

    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(0) {
            info!("🟢 Using CUDA device (NVIDIA GPU)");
            return device;
        }
    }

    info!("💻 Using CPU device");
    Device::Cpu
}

/// Force CPU device, ignoring GPU availability.
pub fn cpu_device() -> Device {
    Device::Cpu
}

// ============================================================================
// Normalisation and Distances
// ============================================================================

/// L2-normalise a 1-D feature vector.
///
/// Fails with [`IcarlError::Computation`] on a zero-norm vector instead of
/// producing NaN.
pub fn l2_normalize(vector: &Tensor) -> Result<Tensor> {
    let norm = vector.sqr()?.sum_all()?.sqrt()?.to_scalar::<f32>()?;
    if !norm.is_finite() || norm <= NORM_EPS {
        return Err(IcarlError::Computation(format!(
            "cannot normalise vector with norm {}",
            norm
        )));
    }
    (vector / norm as f64).map_err(|e| IcarlError::Tensor(format!("normalise failed: {}", e)))
}

/// L2-normalise every row of a `(n, d)` matrix.
///
/// Fails with [`IcarlError::Computation`] naming the first degenerate row.
pub fn l2_normalize_rows(matrix: &Tensor) -> Result<Tensor> {
    let (rows, _) = matrix.dims2()?;
    if rows == 0 {
        return Ok(matrix.clone());
    }

    let norms = matrix.sqr()?.sum_keepdim(1)?.sqrt()?;
    let values = norms.flatten_all()?.to_vec1::<f32>()?;
    if let Some(row) = values.iter().position(|n| !n.is_finite() || *n <= NORM_EPS) {
        return Err(IcarlError::Computation(format!(
            "feature row {} has degenerate norm {}",
            row, values[row]
        )));
    }

    matrix
        .broadcast_div(&norms)
        .map_err(|e| IcarlError::Tensor(format!("row normalise failed: {}", e)))
}

/// Squared Euclidean distances between every row of `a` `(b, d)` and every
/// row of `b` `(k, d)`, returned as `(b, k)`.
pub fn squared_distances(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let (_, da) = a.dims2()?;
    let (_, db) = b.dims2()?;
    if da != db {
        return Err(IcarlError::Shape {
            expected: format!("[_, {}]", db),
            actual: format!("{:?}", a.dims()),
        });
    }

    let diff = a.unsqueeze(1)?.broadcast_sub(&b.unsqueeze(0)?)?;
    diff.sqr()?
        .sum(2)
        .map_err(|e| IcarlError::Tensor(format!("distance sum failed: {}", e)))
}

/// Fail with [`IcarlError::Computation`] when a scalar tensor is NaN or infinite.
pub fn ensure_finite(scalar: &Tensor, what: &str) -> Result<f32> {
    let value = scalar.to_dtype(candle_core::DType::F32)?.to_scalar::<f32>()?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(IcarlError::Computation(format!("{} is not finite ({})", what, value)))
    }
}

// ============================================================================
// Losses
// ============================================================================

/// Binary cross-entropy loss, averaged over all elements
///
/// BCE = -[y * log(p) + (1-y) * log(1-p)]
pub fn binary_cross_entropy(pred: &Tensor, target: &Tensor) -> Result<Tensor> {
    let eps = 1e-7f32;
    let pred_clamped = pred
        .clamp(eps, 1.0 - eps)
        .map_err(|e| IcarlError::Tensor(format!("Clamp failed: {}", e)))?;
    let log_p = pred_clamped
        .log()
        .map_err(|e| IcarlError::Tensor(format!("Log failed: {}", e)))?;

    // ones_like keeps the dtype instead of promoting through an f64 literal
    let ones = Tensor::ones_like(&pred_clamped)?;
    let log_1_p = (&ones - &pred_clamped)?
        .log()
        .map_err(|e| IcarlError::Tensor(format!("Log 1-p failed: {}", e)))?;

    let term1 = target
        .mul(&log_p)
        .map_err(|e| IcarlError::Tensor(format!("BCE term1 failed: {}", e)))?;
    let one_minus_target = (&Tensor::ones_like(target)? - target)?;
    let term2 = one_minus_target
        .mul(&log_1_p)
        .map_err(|e| IcarlError::Tensor(format!("BCE term2 failed: {}", e)))?;

    (term1 + term2)?
        .neg()?
        .mean_all()
        .map_err(|e| IcarlError::Tensor(format!("BCE mean failed: {}", e)))
}

/// Categorical cross-entropy between raw logits `(b, c)` and `u32` labels `(b,)`
pub fn cross_entropy(logits: &Tensor, labels: &Tensor) -> Result<Tensor> {
    candle_nn::loss::cross_entropy(logits, labels)
        .map_err(|e| IcarlError::Tensor(format!("cross-entropy failed: {}", e)))
}
