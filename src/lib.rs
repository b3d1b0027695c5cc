//! # an-icarl
//!
//! Class-incremental image classification on candle: a model that learns new
//! classes over a sequence of sessions without forgetting the old ones, under a
//! fixed per-class exemplar budget.
//!
//! ## Overview
//!
//! Core capabilities:
//!
//! - **Memory**: Herding-selected, importance-ordered exemplar sets per class
//! - **Head**: Bias-free linear output layer that grows as classes arrive
//! - **Training**: Session protocol combining cross-entropy on all classes with
//!   per-class sigmoid distillation against pre-update soft targets
//! - **NCM**: Nearest-mean-of-exemplars classifier with a lazily recomputed cache
//!
//! ## Data Flow Per Session
//!
//! ```text
//! new-class data ──► fuse exemplars ──► snapshot soft targets ──► train
//!                                                                  │
//!        classify ◄── class means (lazy) ◄── reduce + construct ◄──┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use an_icarl::prelude::*;
//!
//! let device = best_device();
//! let config = IcarlConfig::load("icarl.toml")?;
//! let extractor = MlpExtractor::new(3 * 32 * 32, 512, config.feature_size, config.seed, &device)?;
//! let mut net = IcarlNet::new(extractor, 10, config, &device)?;
//!
//! for mut session in sessions {
//!     let report = net.learn_session(&mut session)?;
//!     println!("{} new classes, final loss {:.4}", report.new_classes, report.final_loss);
//! }
//!
//! let preds = net.classify(&batch, &Identity)?;
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod config;
pub mod dataset;
pub mod extractor;
pub mod head;
pub mod memory;
pub mod model;
pub mod ncm;
pub mod primitives;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

/// Error types for incremental learning operations
#[derive(Debug, thiserror::Error)]
pub enum IcarlError {
    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Numerical fault: {0}")]
    Computation(String),

    #[error("Shape mismatch: expected {expected}, got {actual}")]
    Shape { expected: String, actual: String },

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Exemplar memory error: {0}")]
    Memory(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for incremental learning operations
pub type Result<T> = std::result::Result<T, IcarlError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{IcarlError, Result};

    pub use crate::config::IcarlConfig;

    // Primitives
    pub use crate::primitives::{
        best_device, binary_cross_entropy, cpu_device, gpu_disabled, l2_normalize,
        l2_normalize_rows, sigmoid, squared_distances,
    };

    // Data
    pub use crate::dataset::{
        DatasetSource, Identity, ImageDataset, ImageTransform, IncrementalDataset, Normalize,
        Sample, CIFAR10, CIFAR100,
    };

    // Model components
    pub use crate::extractor::{FeatureExtractor, FeatureNorm, MlpExtractor, Mode};
    pub use crate::head::IncrementalHead;
    pub use crate::memory::{ExemplarSet, ExemplarStore};
    pub use crate::model::IcarlNet;
    pub use crate::ncm::{nearest_class, ClassMeans, MeanTable};

    // Training utilities
    pub use crate::training::{
        session_loss, AdamOptimizer, AdamParams, LossBreakdown, MetricsTracker, SessionReport,
        TrainingMetrics,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = cpu_device();
        assert!(matches!(device, Device::Cpu));
        let config = IcarlConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_error_display() {
        let err = crate::IcarlError::Shape {
            expected: "[4, 8]".into(),
            actual: "[4, 6]".into(),
        };
        assert_eq!(err.to_string(), "Shape mismatch: expected [4, 8], got [4, 6]");
    }
}
