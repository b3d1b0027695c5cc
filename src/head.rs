//! Incremental Classifier Head
//!
//! A bias-free linear layer `logits = x · Wᵀ` whose output width grows as
//! classes are introduced. Growth allocates a fresh `(out + n, in)` weight,
//! copies the old rows into its prefix and zero-fills the new rows; the old
//! buffer is never aliased by the new one.
//!
//! Logits are only ever compared against each other, so there is no bias.

use candle_core::{DType, Device, Tensor, Var};
use tracing::debug;

use crate::{IcarlError, Result};

/// Growable bias-free output layer
pub struct IncrementalHead {
    weight: Var,
    in_features: usize,
    out_features: usize,
}

impl IncrementalHead {
    /// Zero-initialised head with `out_features` classes
    pub fn new(in_features: usize, out_features: usize, device: &Device) -> Result<Self> {
        if in_features == 0 {
            return Err(IcarlError::Config("head in_features must be > 0".into()));
        }
        if out_features == 0 {
            return Err(IcarlError::Config("head needs at least one class".into()));
        }
        let weight = Var::zeros((out_features, in_features), DType::F32, device)
            .map_err(|e| IcarlError::Tensor(format!("Failed to create head weight: {}", e)))?;
        Ok(Self {
            weight,
            in_features,
            out_features,
        })
    }

    /// Head initialised from an existing `(out, in)` weight matrix
    pub fn from_weight(weight: &Tensor) -> Result<Self> {
        let (out_features, in_features) = weight.dims2()?;
        if out_features == 0 || in_features == 0 {
            return Err(IcarlError::Config(format!(
                "head weight must be non-empty, got {:?}",
                weight.dims()
            )));
        }
        let weight = Var::from_tensor(&weight.to_dtype(DType::F32)?)?;
        Ok(Self {
            weight,
            in_features,
            out_features,
        })
    }

    /// Logits `(b, out_features)` for features `(b, in_features)`
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_, width) = x.dims2()?;
        if width != self.in_features {
            return Err(IcarlError::Shape {
                expected: format!("[_, {}]", self.in_features),
                actual: format!("{:?}", x.dims()),
            });
        }
        x.matmul(&self.weight.as_tensor().t()?)
            .map_err(|e| IcarlError::Tensor(format!("head matmul failed: {}", e)))
    }

    /// Append `n` zero-initialised output rows.
    ///
    /// Returns the replaced weight so optimizer state keyed on it can be
    /// migrated. `n == 0` leaves the head unchanged and returns `None`.
    pub fn increment_classes(&mut self, n: usize) -> Result<Option<Var>> {
        if n == 0 {
            debug!("increment_classes(0): head unchanged at {}", self.out_features);
            return Ok(None);
        }

        let old = self.weight.as_tensor();
        let fresh = Tensor::zeros((n, self.in_features), old.dtype(), old.device())?;
        let grown = Tensor::cat(&[&old.detach(), &fresh], 0)
            .map_err(|e| IcarlError::Tensor(format!("head growth failed: {}", e)))?;
        let grown = Var::from_tensor(&grown)?;

        let previous = std::mem::replace(&mut self.weight, grown);
        debug!(
            "head grown {} -> {} classes",
            self.out_features,
            self.out_features + n
        );
        self.out_features += n;
        Ok(Some(previous))
    }

    /// Grow to cover exactly the given new class labels.
    ///
    /// The labels must be the contiguous range `out_features..out_features + k`;
    /// labels already represented, gaps or duplicates are configuration errors.
    pub fn add_classes(&mut self, labels: &[u32]) -> Result<Option<Var>> {
        let mut sorted = labels.to_vec();
        sorted.sort_unstable();
        for (offset, &label) in sorted.iter().enumerate() {
            let expected = (self.out_features + offset) as u32;
            if label != expected {
                return Err(IcarlError::Config(format!(
                    "class {} cannot be added to a head with {} classes (expected {})",
                    label, self.out_features, expected
                )));
            }
        }
        self.increment_classes(sorted.len())
    }

    /// The current weight parameter
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Input width
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output width (number of classes)
    pub fn out_features(&self) -> usize {
        self.out_features
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn random_head(out: usize, inp: usize) -> IncrementalHead {
        let w = Tensor::randn(0.0f32, 1.0, (out, inp), &Device::Cpu).unwrap();
        IncrementalHead::from_weight(&w).unwrap()
    }

    #[test]
    fn test_increment_preserves_prefix_and_zeroes_new_rows() {
        let mut head = random_head(10, 6);
        let before = head.weight().as_tensor().to_vec2::<f32>().unwrap();

        let previous = head.increment_classes(2).unwrap();
        assert!(previous.is_some());
        assert_eq!(head.out_features(), 12);

        let after = head.weight().as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(after.len(), 12);
        for row in 0..10 {
            for col in 0..6 {
                assert_eq!(after[row][col].to_bits(), before[row][col].to_bits());
            }
        }
        for row in &after[10..] {
            assert!(row.iter().all(|&w| w == 0.0));
        }
    }

    #[test]
    fn test_old_weight_not_aliased() {
        let mut head = random_head(3, 2);
        let previous = head.increment_classes(1).unwrap().unwrap();
        assert_eq!(previous.as_tensor().dims(), &[3, 2]);
        assert_ne!(previous.as_tensor().id(), head.weight().as_tensor().id());
    }

    #[test]
    fn test_increment_zero_is_noop() {
        let mut head = random_head(4, 2);
        let id = head.weight().as_tensor().id();
        assert!(head.increment_classes(0).unwrap().is_none());
        assert_eq!(head.out_features(), 4);
        assert_eq!(head.weight().as_tensor().id(), id);
    }

    #[test]
    fn test_forward_shape_and_new_logits_zero() {
        let mut head = random_head(2, 3);
        head.increment_classes(2).unwrap();
        let x = Tensor::ones((5, 3), DType::F32, &Device::Cpu).unwrap();
        let logits = head.forward(&x).unwrap();
        assert_eq!(logits.dims(), &[5, 4]);
        let row = &logits.to_vec2::<f32>().unwrap()[0];
        assert_eq!(row[2], 0.0);
        assert_eq!(row[3], 0.0);
    }

    #[test]
    fn test_add_classes_rejects_known_or_gapped_labels() {
        let mut head = IncrementalHead::new(4, 5, &Device::Cpu).unwrap();
        assert!(matches!(head.add_classes(&[3, 5]), Err(IcarlError::Config(_))));
        assert!(matches!(head.add_classes(&[5, 7]), Err(IcarlError::Config(_))));
        assert!(matches!(head.add_classes(&[5, 5]), Err(IcarlError::Config(_))));
        assert_eq!(head.out_features(), 5);

        head.add_classes(&[6, 5]).unwrap();
        assert_eq!(head.out_features(), 7);
    }

    #[test]
    fn test_forward_rejects_wrong_width() {
        let head = IncrementalHead::new(4, 2, &Device::Cpu).unwrap();
        let x = Tensor::ones((1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(head.forward(&x), Err(IcarlError::Shape { .. })));
    }
}
