//! Session loss: classification plus distillation
//!
//! ```text
//! L = CE(logits, labels) + Σ_{y < n_known} BCE(σ(logits[:, y]), q[:, y])
//! ```
//!
//! `q` holds the sigmoid outputs of the network snapshotted before the
//! session started. The distillation sum has one term per previously known
//! class and is empty in the first session.

use candle_core::Tensor;

use crate::primitives::{binary_cross_entropy, cross_entropy, sigmoid};
use crate::{IcarlError, Result};

/// A session loss and its parts
#[derive(Debug, Clone)]
pub struct LossBreakdown {
    /// Value to backpropagate
    pub total: Tensor,
    /// Cross-entropy against the hard labels
    pub classification: Tensor,
    /// Sum of the per-class distillation terms, if any
    pub distillation: Option<Tensor>,
    /// Number of BCE terms in the distillation sum
    pub distillation_terms: usize,
}

/// Loss for one minibatch.
///
/// `soft_targets` are the snapshot rows `(b, >= n_known)` for this batch and
/// are only read when `n_known > 0`.
pub fn session_loss(
    logits: &Tensor,
    labels: &Tensor,
    soft_targets: Option<&Tensor>,
    n_known: usize,
) -> Result<LossBreakdown> {
    let classification = cross_entropy(logits, labels)?;
    if n_known == 0 {
        return Ok(LossBreakdown {
            total: classification.clone(),
            classification,
            distillation: None,
            distillation_terms: 0,
        });
    }

    let targets = soft_targets.ok_or_else(|| {
        IcarlError::Training(format!("{} known classes but no soft targets", n_known))
    })?;
    let (batch, width) = logits.dims2()?;
    let (t_batch, t_width) = targets.dims2()?;
    if t_batch != batch || t_width < n_known || width < n_known {
        return Err(IcarlError::Shape {
            expected: format!("[{}, >= {}]", batch, n_known),
            actual: format!("logits {:?}, targets {:?}", logits.dims(), targets.dims()),
        });
    }

    let probs = sigmoid(&logits.narrow(1, 0, n_known)?)?;
    let mut terms = Vec::with_capacity(n_known);
    for y in 0..n_known {
        terms.push(binary_cross_entropy(
            &probs.narrow(1, y, 1)?,
            &targets.narrow(1, y, 1)?,
        )?);
    }
    let distillation = Tensor::stack(&terms, 0)?.sum_all()?;
    let total = (&classification + &distillation)?;

    Ok(LossBreakdown {
        total,
        classification,
        distillation: Some(distillation),
        distillation_terms: terms.len(),
    })
}
