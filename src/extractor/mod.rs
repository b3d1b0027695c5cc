//! Feature Extraction
//!
//! The boundary between the learner and the representation it trains in
//! place. The convolutional architecture itself is supplied by the caller
//! through [`FeatureExtractor`]; [`MlpExtractor`] is a small reference
//! implementation used by tests and demos.
//!
//! ## Modes
//!
//! Every forward call names its [`Mode`] explicitly, so there is no stored
//! train/eval flag to forget to restore. [`EvalScope`] is the inference-only
//! view: eval mode, outputs detached from the graph, output shape checked
//! against the configured feature size.
//!
//! ```rust,ignore
//! let scope = EvalScope::new(&extractor);
//! let features = scope.extract(&images, &Identity, 100)?; // (n, feature_size), no grad
//! ```

mod mlp;
mod norm;

pub use mlp::MlpExtractor;
pub use norm::FeatureNorm;

use candle_core::{Tensor, Var};

use crate::dataset::ImageTransform;
use crate::{IcarlError, Result};

/// Forward-pass mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Gradient-tracked, normalisation layers use and update batch statistics
    Train,
    /// Inference-only, normalisation layers use running statistics
    Eval,
}

impl Mode {
    /// Whether this is training mode
    pub fn is_train(&self) -> bool {
        matches!(self, Mode::Train)
    }
}

/// Maps image batches `(b, C, H, W)` to embeddings `(b, feature_size)`
pub trait FeatureExtractor: Send + Sync {
    /// Embedding dimensionality
    fn feature_size(&self) -> usize;

    /// Embed a batch of images
    fn embed(&self, images: &Tensor, mode: Mode) -> Result<Tensor>;

    /// Parameters the session optimizer updates
    fn trainable_vars(&self) -> Vec<Var>;
}

/// Embed and check the output is `(b, feature_size)`.
pub fn embed_checked<E: FeatureExtractor + ?Sized>(
    extractor: &E,
    images: &Tensor,
    mode: Mode,
) -> Result<Tensor> {
    let batch = images.dims().first().copied().unwrap_or(0);
    let features = extractor.embed(images, mode)?;
    let expected = [batch, extractor.feature_size()];
    if features.dims() != expected {
        return Err(IcarlError::Shape {
            expected: format!("{:?}", expected),
            actual: format!("{:?}", features.dims()),
        });
    }
    Ok(features)
}

/// Inference-only view over an extractor
pub struct EvalScope<'a, E: FeatureExtractor + ?Sized> {
    extractor: &'a E,
}

impl<'a, E: FeatureExtractor + ?Sized> EvalScope<'a, E> {
    /// Borrow `extractor` for no-gradient evaluation
    pub fn new(extractor: &'a E) -> Self {
        Self { extractor }
    }

    /// Embed one stacked batch, detached
    pub fn embed(&self, images: &Tensor) -> Result<Tensor> {
        Ok(embed_checked(self.extractor, images, Mode::Eval)?.detach())
    }

    /// Transform and embed raw images in batches of `batch_size`.
    ///
    /// Returns raw (unnormalised) features `(n, feature_size)` in input order.
    pub fn extract(
        &self,
        images: &[Tensor],
        transform: &dyn ImageTransform,
        batch_size: usize,
    ) -> Result<Tensor> {
        if images.is_empty() {
            return Err(IcarlError::Memory("no images to extract features from".into()));
        }

        let mut chunks = Vec::with_capacity(images.len().div_ceil(batch_size.max(1)));
        for chunk in images.chunks(batch_size.max(1)) {
            let transformed = chunk
                .iter()
                .map(|img| transform.apply(img))
                .collect::<Result<Vec<_>>>()?;
            let stacked = Tensor::stack(&transformed, 0)?;
            chunks.push(self.embed(&stacked)?);
        }
        Tensor::cat(&chunks, 0).map_err(|e| IcarlError::Tensor(format!("feature concat failed: {}", e)))
    }
}
