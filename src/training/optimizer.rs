//! Adam with growable parameter state
//!
//! candle-nn's `AdamW` fixes its variable list at construction, but the
//! classifier head is reallocated every time classes are added. This Adam
//! keeps its first and second moments per parameter and can migrate them to
//! a grown replacement: old rows keep their moments, new rows start at zero.
//! The optimizer lives as long as the model and is never reset between
//! sessions.
//!
//! Weight decay is L2 (added to the gradient), not decoupled.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{IcarlError, Result};

/// Adam hyperparameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdamParams {
    /// Step size
    pub lr: f64,
    /// First-moment decay
    pub beta1: f64,
    /// Second-moment decay
    pub beta2: f64,
    /// Denominator stabiliser
    pub eps: f64,
    /// L2 penalty coefficient
    pub weight_decay: f64,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            lr: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }
}

struct ParamState {
    var: Var,
    m: Tensor,
    v: Tensor,
    step: i32,
}

impl ParamState {
    fn new(var: Var) -> Result<Self> {
        let m = var.as_tensor().zeros_like()?;
        let v = var.as_tensor().zeros_like()?;
        Ok(Self { var, m, v, step: 0 })
    }
}

/// Adam optimizer whose parameters can be regrown in place
pub struct AdamOptimizer {
    params: AdamParams,
    state: Vec<ParamState>,
}

impl AdamOptimizer {
    /// Create an optimizer over `vars`
    pub fn new(vars: Vec<Var>, params: AdamParams) -> Result<Self> {
        if !(params.lr.is_finite() && params.lr > 0.0) {
            return Err(IcarlError::Config(format!("invalid learning rate {}", params.lr)));
        }
        let state = vars
            .into_iter()
            .map(ParamState::new)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { params, state })
    }

    /// Take a gradient step on every parameter that has a gradient
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let AdamParams {
            lr,
            beta1,
            beta2,
            eps,
            weight_decay,
        } = self.params;

        for p in &mut self.state {
            let Some(grad) = grads.get(p.var.as_tensor()) else {
                continue;
            };
            let theta = p.var.as_tensor().detach();
            let grad = if weight_decay > 0.0 {
                (grad + (&theta * weight_decay)?)?
            } else {
                grad.clone()
            };

            p.step += 1;
            p.m = ((&p.m * beta1)? + (&grad * (1.0 - beta1))?)?;
            p.v = ((&p.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?;

            let m_hat = (&p.m / (1.0 - beta1.powi(p.step)))?;
            let v_hat = (&p.v / (1.0 - beta2.powi(p.step)))?;
            let update = (m_hat / (v_hat.sqrt()? + eps)?)?;
            let next = (theta - (update * lr)?)?;

            p.var
                .set(&next)
                .map_err(|e| IcarlError::Training(format!("Adam update failed: {}", e)))?;
        }
        Ok(())
    }

    /// Swap `old` for its grown replacement `new`, carrying its moments over.
    ///
    /// `new` must match `old` in every dimension except the first, which may
    /// only grow. Moment rows for the added entries start at zero.
    pub fn regrow(&mut self, old: &Var, new: Var) -> Result<()> {
        let slot = self
            .state
            .iter_mut()
            .find(|p| p.var.as_tensor().id() == old.as_tensor().id())
            .ok_or_else(|| IcarlError::Training("regrow: parameter not managed by optimizer".into()))?;

        let old_dims = slot.var.as_tensor().dims().to_vec();
        let new_dims = new.as_tensor().dims().to_vec();
        if old_dims.is_empty()
            || old_dims.len() != new_dims.len()
            || old_dims[1..] != new_dims[1..]
            || new_dims[0] < old_dims[0]
        {
            return Err(IcarlError::Shape {
                expected: format!("{:?} grown along dim 0", old_dims),
                actual: format!("{:?}", new_dims),
            });
        }

        let extra = new_dims[0] - old_dims[0];
        if extra > 0 {
            let mut pad_dims = new_dims.clone();
            pad_dims[0] = extra;
            let pad = Tensor::zeros(pad_dims, slot.m.dtype(), slot.m.device())?;
            slot.m = Tensor::cat(&[&slot.m, &pad], 0)?;
            slot.v = Tensor::cat(&[&slot.v, &pad], 0)?;
        }
        slot.var = new;
        Ok(())
    }

    /// Parameters under optimization
    pub fn vars(&self) -> Vec<Var> {
        self.state.iter().map(|p| p.var.clone()).collect()
    }

    /// Get the learning rate
    pub fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    /// Set the learning rate
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    /// Hyperparameters
    pub fn params(&self) -> &AdamParams {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn var(vals: &[f32], shape: (usize, usize)) -> Var {
        Var::from_tensor(&Tensor::from_vec(vals.to_vec(), shape, &Device::Cpu).unwrap()).unwrap()
    }

    #[test]
    fn test_first_step_moves_by_lr() {
        let w = var(&[1.0, -1.0], (1, 2));
        let mut opt = AdamOptimizer::new(
            vec![w.clone()],
            AdamParams {
                lr: 0.1,
                ..Default::default()
            },
        )
        .unwrap();

        // d/dw sum(w) = 1 everywhere; bias-corrected first Adam step is -lr * sign
        let grads = w.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();

        let vals = w.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 0.9).abs() < 1e-4);
        assert!((vals[1] + 1.1).abs() < 1e-4);
    }

    #[test]
    fn test_minimizes_quadratic() {
        let w = var(&[3.0, -2.0], (1, 2));
        let mut opt = AdamOptimizer::new(
            vec![w.clone()],
            AdamParams {
                lr: 0.05,
                ..Default::default()
            },
        )
        .unwrap();

        for _ in 0..300 {
            let loss = w.as_tensor().sqr().unwrap().sum_all().unwrap();
            let grads = loss.backward().unwrap();
            opt.step(&grads).unwrap();
        }
        let vals = w.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(vals.iter().all(|v| v.abs() < 0.1));
    }

    /// One step on loss = sum(w * c) with the given decay
    fn step_with_decay(weight_decay: f64) -> Vec<f32> {
        let w = var(&[2.0, 2.0], (1, 2));
        let c = Tensor::from_vec(vec![1.0f32, -0.1], (1, 2), &Device::Cpu).unwrap();
        let mut opt = AdamOptimizer::new(
            vec![w.clone()],
            AdamParams {
                lr: 0.01,
                weight_decay,
                ..Default::default()
            },
        )
        .unwrap();

        let loss = w.as_tensor().mul(&c).unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        opt.step(&grads).unwrap();
        w.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn test_weight_decay_pulls_toward_zero() {
        let plain = step_with_decay(0.0);
        let decayed = step_with_decay(0.1);

        // grad [1.0, -0.1]: both elements move by lr against the gradient sign
        assert!((plain[0] - 1.99).abs() < 1e-4);
        assert!((plain[1] - 2.01).abs() < 1e-4);

        // decay adds 0.1 * 2.0 = 0.2: grad [1.2, 0.1] flips the second element
        assert!((decayed[0] - 1.99).abs() < 1e-4);
        assert!((decayed[1] - 1.99).abs() < 1e-4);
        assert!(decayed[1] < plain[1]);
        assert!((plain[1] - decayed[1] - 0.02).abs() < 1e-4);
    }

    #[test]
    fn test_regrow_keeps_moments_and_pads_zeros() {
        let w = var(&[1.0, 2.0, 3.0, 4.0], (2, 2));
        let mut opt = AdamOptimizer::new(vec![w.clone()], AdamParams::default()).unwrap();
        let grads = w.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        let m_before = opt.state[0].m.to_vec2::<f32>().unwrap();

        let grown = Tensor::cat(
            &[
                &w.as_tensor().detach(),
                &Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap(),
            ],
            0,
        )
        .unwrap();
        let grown = Var::from_tensor(&grown).unwrap();
        opt.regrow(&w, grown.clone()).unwrap();

        let m_after = opt.state[0].m.to_vec2::<f32>().unwrap();
        assert_eq!(m_after.len(), 3);
        assert_eq!(m_after[..2], m_before[..]);
        assert_eq!(m_after[2], vec![0.0, 0.0]);
        assert_eq!(opt.vars()[0].as_tensor().id(), grown.as_tensor().id());

        // the grown parameter is the one that now receives updates
        let grads = grown.as_tensor().sum_all().unwrap().backward().unwrap();
        opt.step(&grads).unwrap();
        let row = &grown.as_tensor().to_vec2::<f32>().unwrap()[2];
        assert!(row.iter().all(|v| *v < 0.0));
    }

    #[test]
    fn test_regrow_rejects_unknown_or_shrunk() {
        let w = var(&[1.0, 2.0], (1, 2));
        let mut opt = AdamOptimizer::new(vec![w.clone()], AdamParams::default()).unwrap();

        let stranger = var(&[0.0, 0.0], (1, 2));
        assert!(opt.regrow(&stranger, var(&[0.0; 4], (2, 2))).is_err());
        assert!(opt.regrow(&w, var(&[0.0; 3], (1, 3))).is_err());
    }

    #[test]
    fn test_learning_rate_accessors() {
        let mut opt = AdamOptimizer::new(vec![], AdamParams::default()).unwrap();
        assert!((opt.learning_rate() - 0.001).abs() < 1e-12);
        opt.set_learning_rate(0.01);
        assert!((opt.learning_rate() - 0.01).abs() < 1e-12);
        assert!(AdamOptimizer::new(vec![], AdamParams { lr: 0.0, ..Default::default() }).is_err());
    }
}
