//! Two-layer perceptron feature extractor
//!
//! Flattens each image and maps it through `Linear → ReLU → Linear`.
//! Weights are drawn from a seeded ChaCha stream so two extractors built
//! with the same seed are identical.

use candle_core::{DType, Device, Tensor, Var};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::{FeatureExtractor, Mode};
use crate::primitives::relu;
use crate::{IcarlError, Result};

/// Fully-connected reference extractor
pub struct MlpExtractor {
    w1: Var,
    b1: Var,
    w2: Var,
    b2: Var,
    input_dim: usize,
    feature_size: usize,
}

impl MlpExtractor {
    /// Create an extractor for flattened inputs of `input_dim` values
    pub fn new(
        input_dim: usize,
        hidden_dim: usize,
        feature_size: usize,
        seed: u64,
        device: &Device,
    ) -> Result<Self> {
        if input_dim == 0 || hidden_dim == 0 || feature_size == 0 {
            return Err(IcarlError::Config(format!(
                "extractor dims must be > 0, got {}x{}x{}",
                input_dim, hidden_dim, feature_size
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let w1 = uniform_var(&mut rng, (input_dim, hidden_dim), input_dim, device)?;
        let b1 = uniform_var(&mut rng, hidden_dim, input_dim, device)?;
        let w2 = uniform_var(&mut rng, (hidden_dim, feature_size), hidden_dim, device)?;
        let b2 = uniform_var(&mut rng, feature_size, hidden_dim, device)?;

        Ok(Self {
            w1,
            b1,
            w2,
            b2,
            input_dim,
            feature_size,
        })
    }

    /// Flattened input width
    pub fn input_dim(&self) -> usize {
        self.input_dim
    }
}

/// U(-1/√fan_in, 1/√fan_in), the usual linear-layer initialisation
fn uniform_var<S: Into<candle_core::Shape>>(
    rng: &mut ChaCha8Rng,
    shape: S,
    fan_in: usize,
    device: &Device,
) -> Result<Var> {
    let shape = shape.into();
    let bound = 1.0 / (fan_in as f32).sqrt();
    let values: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.gen_range(-bound..bound))
        .collect();
    let tensor = Tensor::from_vec(values, shape, device)?.to_dtype(DType::F32)?;
    Var::from_tensor(&tensor).map_err(|e| IcarlError::Tensor(format!("Failed to create var: {}", e)))
}

impl FeatureExtractor for MlpExtractor {
    fn feature_size(&self) -> usize {
        self.feature_size
    }

    fn embed(&self, images: &Tensor, _mode: Mode) -> Result<Tensor> {
        let x = images.flatten_from(1)?;
        let (_, width) = x.dims2()?;
        if width != self.input_dim {
            return Err(IcarlError::Shape {
                expected: format!("[_, {}] after flatten", self.input_dim),
                actual: format!("{:?}", images.dims()),
            });
        }

        let hidden = relu(&x.matmul(self.w1.as_tensor())?.broadcast_add(self.b1.as_tensor())?)?;
        hidden
            .matmul(self.w2.as_tensor())?
            .broadcast_add(self.b2.as_tensor())
            .map_err(|e| IcarlError::Tensor(format!("extractor output failed: {}", e)))
    }

    fn trainable_vars(&self) -> Vec<Var> {
        vec![
            self.w1.clone(),
            self.b1.clone(),
            self.w2.clone(),
            self.b2.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_shape() {
        let ext = MlpExtractor::new(12, 8, 5, 0, &Device::Cpu).unwrap();
        let images = Tensor::ones((3, 3, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let out = ext.embed(&images, Mode::Train).unwrap();
        assert_eq!(out.dims(), &[3, 5]);
        assert_eq!(ext.trainable_vars().len(), 4);
    }

    #[test]
    fn test_seeded_init_is_reproducible() {
        let a = MlpExtractor::new(4, 4, 2, 42, &Device::Cpu).unwrap();
        let b = MlpExtractor::new(4, 4, 2, 42, &Device::Cpu).unwrap();
        let wa = a.w1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let wb = b.w1.as_tensor().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(wa, wb);

        let bound = 1.0 / 2.0;
        assert!(wa.iter().all(|w| w.abs() <= bound));
    }

    #[test]
    fn test_rejects_wrong_input_width() {
        let ext = MlpExtractor::new(4, 4, 2, 0, &Device::Cpu).unwrap();
        let images = Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            ext.embed(&images, Mode::Eval),
            Err(IcarlError::Shape { .. })
        ));
    }

    #[test]
    fn test_zero_dims_rejected() {
        assert!(MlpExtractor::new(0, 4, 2, 0, &Device::Cpu).is_err());
    }
}
