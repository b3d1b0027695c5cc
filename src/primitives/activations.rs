//! Activation Functions
//!
//! Activations used by the classifier head path and the distillation loss.

use crate::{IcarlError, Result};
use candle_core::Tensor;

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
///
/// The model's output activation. Soft targets and the distillation term are
/// both taken through sigmoid, one-vs-rest per class, never softmax.
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let neg = tensor
        .neg()
        .map_err(|e| IcarlError::Tensor(format!("sigmoid neg failed: {}", e)))?;
    let exp_neg = neg
        .exp()
        .map_err(|e| IcarlError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    let one_plus = (exp_neg + 1.0)
        .map_err(|e| IcarlError::Tensor(format!("sigmoid add failed: {}", e)))?;
    one_plus
        .recip()
        .map_err(|e| IcarlError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// ReLU activation: max(0, x)
pub fn relu(tensor: &Tensor) -> Result<Tensor> {
    tensor
        .relu()
        .map_err(|e| IcarlError::Tensor(format!("ReLU failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor(vals: &[f32]) -> Tensor {
        Tensor::from_vec(vals.to_vec(), vals.len(), &Device::Cpu).unwrap()
    }

    #[test]
    fn test_sigmoid() {
        let s = sigmoid(&tensor(&[0.0])).unwrap();
        let val = s.to_vec1::<f32>().unwrap()[0];

        // sigmoid(0) = 0.5
        assert!((val - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_sigmoid_extremes() {
        let vals = sigmoid(&tensor(&[100.0, -100.0])).unwrap().to_vec1::<f32>().unwrap();
        assert!((vals[0] - 1.0).abs() < 0.001);
        assert!(vals[1].abs() < 0.001);
    }

    #[test]
    fn test_sigmoid_matches_candle() {
        let t = tensor(&[-3.0, -0.5, 0.25, 2.0]);
        let ours = sigmoid(&t).unwrap().to_vec1::<f32>().unwrap();
        let theirs = candle_nn::ops::sigmoid(&t).unwrap().to_vec1::<f32>().unwrap();
        for (a, b) in ours.iter().zip(theirs.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_relu() {
        let vals = relu(&tensor(&[-2.0, -1.0, 0.0, 1.0, 2.0]))
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(vals, vec![0.0, 0.0, 0.0, 1.0, 2.0]);
    }
}
