//! Batch normalisation over embeddings
//!
//! Sits between the extractor and the classifier head. Train mode normalises
//! with the batch's own statistics and folds them into the running averages;
//! eval mode uses the running averages and leaves them untouched.

use candle_core::{DType, Device, Tensor, Var};
use parking_lot::RwLock;

use super::Mode;
use crate::{IcarlError, Result};

const BN_EPS: f64 = 1e-5;

/// 1-D batch normalisation with learnable scale and shift
pub struct FeatureNorm {
    gamma: Var,
    beta: Var,
    running_mean: RwLock<Tensor>,
    running_var: RwLock<Tensor>,
    momentum: f64,
    size: usize,
}

impl FeatureNorm {
    /// Identity-initialised normalisation over `size` features
    pub fn new(size: usize, momentum: f64, device: &Device) -> Result<Self> {
        let gamma = Var::ones(size, DType::F32, device)
            .map_err(|e| IcarlError::Tensor(format!("Failed to create bn gamma: {}", e)))?;
        let beta = Var::zeros(size, DType::F32, device)
            .map_err(|e| IcarlError::Tensor(format!("Failed to create bn beta: {}", e)))?;

        Ok(Self {
            gamma,
            beta,
            running_mean: RwLock::new(Tensor::zeros(size, DType::F32, device)?),
            running_var: RwLock::new(Tensor::ones(size, DType::F32, device)?),
            momentum,
            size,
        })
    }

    /// Normalise `(b, size)` features.
    ///
    /// A single-row batch in train mode falls back to the running statistics,
    /// since its variance is undefined.
    pub fn forward(&self, x: &Tensor, mode: Mode) -> Result<Tensor> {
        let (batch, width) = x.dims2()?;
        if width != self.size {
            return Err(IcarlError::Shape {
                expected: format!("[_, {}]", self.size),
                actual: format!("{:?}", x.dims()),
            });
        }

        let normalized = if mode.is_train() && batch > 1 {
            let mean = x.mean_keepdim(0)?;
            let centered = x.broadcast_sub(&mean)?;
            let var = centered.sqr()?.mean_keepdim(0)?;
            self.update_running(&mean, &var, batch)?;
            centered.broadcast_div(&(var + BN_EPS)?.sqrt()?)?
        } else {
            let mean = self.running_mean.read().clone();
            let var = self.running_var.read().clone();
            x.broadcast_sub(&mean)?
                .broadcast_div(&(var + BN_EPS)?.sqrt()?)?
        };

        normalized
            .broadcast_mul(self.gamma.as_tensor())?
            .broadcast_add(self.beta.as_tensor())
            .map_err(|e| IcarlError::Tensor(format!("bn affine failed: {}", e)))
    }

    fn update_running(&self, mean: &Tensor, biased_var: &Tensor, batch: usize) -> Result<()> {
        let m = self.momentum;
        let unbiased = (biased_var.detach() * (batch as f64 / (batch - 1) as f64))?.squeeze(0)?;
        let mean = mean.detach().squeeze(0)?;

        let mut rm = self.running_mean.write();
        *rm = ((&*rm * (1.0 - m))? + (mean * m)?)?;
        let mut rv = self.running_var.write();
        *rv = ((&*rv * (1.0 - m))? + (unbiased * m)?)?;
        Ok(())
    }

    /// Learnable scale and shift
    pub fn trainable_vars(&self) -> Vec<Var> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    /// Current running mean and variance
    pub fn running_stats(&self) -> (Tensor, Tensor) {
        (self.running_mean.read().clone(), self.running_var.read().clone())
    }
}
