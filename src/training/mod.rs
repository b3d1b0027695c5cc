//! Training Infrastructure
//!
//! Optimization, losses and learning utilities for the incremental session
//! loop.
//!
//! ## Overview
//!
//! - **Optimizer**: [`AdamOptimizer`], persistent across sessions, able to
//!   follow the classifier head as it grows
//! - **Loss**: [`session_loss`], cross-entropy plus per-class distillation
//! - **Metrics**: per-epoch [`TrainingMetrics`], a cross-session
//!   [`MetricsTracker`] and the [`SessionReport`] returned by each session
//!
//! ## Example
//!
//! ```ignore
//! use an_icarl::training::*;
//!
//! let mut optimizer = AdamOptimizer::new(vars, AdamParams { lr: 0.002, ..Default::default() })?;
//!
//! for batch in batches {
//!     let loss = session_loss(&logits, &batch.labels, Some(&q_batch), n_known)?;
//!     let grads = loss.total.backward()?;
//!     optimizer.step(&grads)?;
//! }
//! ```

mod loss;
mod optimizer;

pub use loss::{session_loss, LossBreakdown};
pub use optimizer::{AdamOptimizer, AdamParams};

use candle_core::backprop::GradStore;
use candle_core::{DType, Var};
use serde::{Deserialize, Serialize};

use crate::{IcarlError, Result};

// =============================================================================
// Metrics
// =============================================================================

/// Training metrics recorded after each epoch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingMetrics {
    /// Session this epoch belongs to (0-based)
    pub session: usize,

    /// Epoch number within the session
    pub epoch: u64,

    /// Mean minibatch loss over the epoch
    pub loss: f32,

    /// Mean distillation share of the loss, if any old classes were known
    pub distillation_loss: Option<f32>,

    /// Number of samples trained on
    pub samples_trained: usize,

    /// Duration of this epoch in milliseconds
    pub duration_ms: u64,
}

impl TrainingMetrics {
    /// Create new training metrics
    pub fn new(session: usize, epoch: u64, loss: f32) -> Self {
        Self {
            session,
            epoch,
            loss,
            distillation_loss: None,
            samples_trained: 0,
            duration_ms: 0,
        }
    }

    /// Builder: set distillation loss
    pub fn with_distillation(mut self, loss: f32) -> Self {
        self.distillation_loss = Some(loss);
        self
    }

    /// Builder: set samples trained
    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples_trained = samples;
        self
    }

    /// Builder: set duration
    pub fn with_duration_ms(mut self, ms: u64) -> Self {
        self.duration_ms = ms;
        self
    }
}

/// Summary of one `update_representation` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    /// Session number (0-based)
    pub session: usize,

    /// Classes introduced by this session
    pub new_classes: usize,

    /// Output width after growth
    pub n_classes: usize,

    /// Exemplars appended during fusion
    pub exemplars_fused: usize,

    /// Size of the fused training set
    pub fused_len: usize,

    /// Optimizer steps taken
    pub steps: usize,

    /// Loss of the last minibatch
    pub final_loss: f32,

    /// Mean minibatch loss over the session
    pub mean_loss: Option<f32>,

    /// Lowest minibatch loss seen in any session so far
    pub best_loss: Option<f32>,

    /// Per-epoch metrics
    pub epochs: Vec<TrainingMetrics>,
}

impl SessionReport {
    /// Mean loss of the last epoch
    pub fn last_epoch_loss(&self) -> Option<f32> {
        self.epochs.last().map(|m| m.loss)
    }
}

/// Loss history across every session
#[derive(Debug, Default)]
pub struct MetricsTracker {
    /// Loss history
    losses: Vec<f32>,

    /// Best loss seen
    best_loss: Option<f32>,

    /// Finished epochs
    epochs: Vec<TrainingMetrics>,
}

impl MetricsTracker {
    /// Create a new metrics tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one minibatch loss
    pub fn record(&mut self, loss: f32) {
        self.losses.push(loss);
        if self.best_loss.map_or(true, |best| loss < best) {
            self.best_loss = Some(loss);
        }
    }

    /// Record a finished epoch
    pub fn record_epoch(&mut self, metrics: TrainingMetrics) {
        self.epochs.push(metrics);
    }

    /// Get average loss over last N steps
    pub fn average_loss(&self, n: usize) -> Option<f32> {
        if self.losses.is_empty() || n == 0 {
            return None;
        }

        let start = self.losses.len().saturating_sub(n);
        let slice = &self.losses[start..];
        Some(slice.iter().sum::<f32>() / slice.len() as f32)
    }

    /// Get best loss
    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    /// Get total training steps
    pub fn total_steps(&self) -> usize {
        self.losses.len()
    }

    /// All recorded epochs, oldest first
    pub fn epochs(&self) -> &[TrainingMetrics] {
        &self.epochs
    }
}

// =============================================================================
// Gradient Utilities
// =============================================================================

/// Compute the total L2 norm of all gradients
///
/// Useful for monitoring gradient explosion during training.
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_sq_norm = 0.0f32;

    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq_norm += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }

    Ok(total_sq_norm.sqrt())
}

/// Check if any gradient contains NaN or Inf
///
/// Gradients of any float dtype are read as F32. Returns true if gradients
/// are healthy (no NaN/Inf).
pub fn check_gradients_health(grads: &GradStore, vars: &[Var]) -> bool {
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let finite = grad
                .to_dtype(DType::F32)
                .and_then(|t| t.flatten_all())
                .and_then(|t| t.to_vec1::<f32>())
                .map(|vals| vals.iter().all(|v| v.is_finite()));
            // unreadable gradients count as unhealthy
            if !matches!(finite, Ok(true)) {
                return false;
            }
        }
    }
    true
}

/// Fail the session when gradients are not finite. They are never skipped.
pub fn ensure_gradients_finite(grads: &GradStore, vars: &[Var]) -> Result<()> {
    if check_gradients_health(grads, vars) {
        Ok(())
    } else {
        Err(IcarlError::Training("NaN or Inf detected in gradients".into()))
    }
}
