//! Learner configuration
//!
//! Hyperparameters for the exemplar memory and the distillation training
//! loop, loaded from TOML or built in code.
//!
//! ```toml
//! feature_size = 2048
//! memory_budget = 20
//! total_memory = 2000
//! learning_rate = 0.002
//! weight_decay = 0.00001
//! epochs_per_session = 5
//! batch_size = 100
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{IcarlError, Result};

/// Configuration for incremental learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IcarlConfig {
    /// Embedding dimensionality produced by the feature extractor
    pub feature_size: usize,

    /// Maximum exemplars retained per class (`m`)
    pub memory_budget: usize,

    /// Total exemplar budget `K` shared by all classes.
    ///
    /// When set, the per-class budget after each session is `K / n_classes`
    /// and `memory_budget` is ignored.
    pub total_memory: Option<usize>,

    /// Adam learning rate
    pub learning_rate: f64,

    /// L2 weight decay folded into the gradient
    pub weight_decay: f64,

    /// Passes over the fused dataset per session
    pub epochs_per_session: usize,

    /// Minibatch size for training, snapshots and feature extraction
    pub batch_size: usize,

    /// Running-statistics momentum of the feature batch-norm
    pub bn_momentum: f64,

    /// Seed for weight initialisation and minibatch shuffling
    pub seed: u64,

    /// Log the running loss every N iterations (0 = never)
    pub log_every: usize,
}

impl Default for IcarlConfig {
    fn default() -> Self {
        Self {
            feature_size: 2048,
            memory_budget: 20,
            total_memory: None,
            learning_rate: 0.002,
            weight_decay: 0.00001,
            epochs_per_session: 5,
            batch_size: 100,
            bn_momentum: 0.01,
            seed: 1993,
            log_every: 10,
        }
    }
}

impl IcarlConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(IcarlError::Io)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| IcarlError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Builder: set embedding size
    pub fn with_feature_size(mut self, feature_size: usize) -> Self {
        self.feature_size = feature_size;
        self
    }

    /// Builder: set per-class exemplar budget
    pub fn with_memory_budget(mut self, m: usize) -> Self {
        self.memory_budget = m;
        self
    }

    /// Builder: share a total exemplar budget across all classes
    pub fn with_total_memory(mut self, k: usize) -> Self {
        self.total_memory = Some(k);
        self
    }

    /// Builder: set epochs per session
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs_per_session = epochs;
        self
    }

    /// Builder: set minibatch size
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder: set learning rate
    pub fn with_learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Builder: set seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Per-class exemplar budget once `n_classes` classes are known
    pub fn exemplars_per_class(&self, n_classes: usize) -> usize {
        match self.total_memory {
            Some(k) => k / n_classes.max(1),
            None => self.memory_budget,
        }
    }

    /// Reject configurations the training loop cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.feature_size == 0 {
            return Err(IcarlError::Config("feature_size must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(IcarlError::Config("batch_size must be > 0".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(IcarlError::Config(format!(
                "learning_rate must be positive and finite, got {}",
                self.learning_rate
            )));
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(IcarlError::Config(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            return Err(IcarlError::Config(format!(
                "bn_momentum must be in [0, 1], got {}",
                self.bn_momentum
            )));
        }
        if self.total_memory == Some(0) {
            return Err(IcarlError::Config("total_memory must be > 0 when set".into()));
        }
        Ok(())
    }
}
