//! Session Datasets
//!
//! The dataset capability set the learner consumes: indexed read returning
//! `(index, transformed_image, label)`, length, and a mutating `append` used
//! to fuse exemplars of old classes into a session's training set.
//!
//! ## Sources
//!
//! [`DatasetSource`] carries static source-location metadata only. CIFAR-10
//! and CIFAR-100 datasets behave identically; decoding archives from disk is
//! left to the caller, which hands decoded `(C, H, W)` image tensors to
//! [`ImageDataset::new`].
//!
//! ## Example
//!
//! ```rust,ignore
//! use an_icarl::dataset::*;
//!
//! let train = ImageDataset::new(CIFAR100, images, labels)?
//!     .retain_classes(&(0..10).collect::<Vec<_>>())
//!     .with_transform(Normalize::new(vec![0.507, 0.487, 0.441], vec![0.267, 0.256, 0.276])?);
//!
//! let sample = train.get(0)?;
//! println!("#{} label={}", sample.index, sample.label);
//! ```

pub mod loader;

pub use loader::{batches, shuffled_order, Batch};

use candle_core::{Device, Tensor};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::{IcarlError, Result};

// =============================================================================
// DATASET TRAIT
// =============================================================================

/// One indexed read from a dataset
#[derive(Debug, Clone)]
pub struct Sample {
    /// Position of this example in the dataset
    pub index: usize,
    /// Image after the dataset's transform
    pub image: Tensor,
    /// Class label
    pub label: u32,
}

/// Index-addressable, appendable image dataset
pub trait IncrementalDataset {
    /// Number of examples
    fn len(&self) -> usize;

    /// Whether the dataset holds no examples
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read example `index` with the dataset transform applied
    fn get(&self, index: usize) -> Result<Sample>;

    /// Labels of all examples, in index order
    fn labels(&self) -> &[u32];

    /// Raw (untransformed) images of every example labelled `label`
    fn images_of_class(&self, label: u32) -> Vec<Tensor>;

    /// Extend the collection with raw images and their labels
    fn append(&mut self, images: Vec<Tensor>, labels: Vec<u32>) -> Result<()>;

    /// Distinct labels present, ascending
    fn classes(&self) -> BTreeSet<u32> {
        self.labels().iter().copied().collect()
    }

    /// Transform applied on indexed read, reused for exemplar features
    fn transform(&self) -> Arc<dyn ImageTransform> {
        Arc::new(Identity)
    }
}

// =============================================================================
// SOURCES
// =============================================================================

/// Static source-location metadata for a dataset family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatasetSource {
    /// Human-readable name
    pub name: &'static str,
    /// Directory the archive extracts to
    pub base_folder: &'static str,
    /// Download location
    pub url: &'static str,
    /// Archive file name
    pub filename: &'static str,
    /// Archive checksum
    pub archive_md5: &'static str,
    /// Number of classes in the full dataset
    pub num_classes: usize,
}

/// CIFAR-10 source metadata
pub const CIFAR10: DatasetSource = DatasetSource {
    name: "cifar10",
    base_folder: "cifar-10-batches-py",
    url: "https://www.cs.toronto.edu/~kriz/cifar-10-python.tar.gz",
    filename: "cifar-10-python.tar.gz",
    archive_md5: "c58f30108f718f92721af3b95e74349a",
    num_classes: 10,
};

/// CIFAR-100 source metadata
pub const CIFAR100: DatasetSource = DatasetSource {
    name: "cifar100",
    base_folder: "cifar-100-python",
    url: "https://www.cs.toronto.edu/~kriz/cifar-100-python.tar.gz",
    filename: "cifar-100-python.tar.gz",
    archive_md5: "eb9058c3a382ffc7106e4002c42a8d85",
    num_classes: 100,
};

// =============================================================================
// TRANSFORMS
// =============================================================================

/// Per-image transform applied on indexed read and before feature extraction
pub trait ImageTransform: Send + Sync {
    /// Transform one `(C, H, W)` image
    fn apply(&self, image: &Tensor) -> Result<Tensor>;
}

/// Pass-through transform
#[derive(Debug, Clone, Copy, Default)]
pub struct Identity;

impl ImageTransform for Identity {
    fn apply(&self, image: &Tensor) -> Result<Tensor> {
        Ok(image.clone())
    }
}

/// Per-channel `(x - mean) / std` normalisation
#[derive(Debug, Clone)]
pub struct Normalize {
    mean: Vec<f32>,
    std: Vec<f32>,
}

impl Normalize {
    /// Create from per-channel statistics
    pub fn new(mean: Vec<f32>, std: Vec<f32>) -> Result<Self> {
        if mean.len() != std.len() || mean.is_empty() {
            return Err(IcarlError::Config(format!(
                "normalize needs matching non-empty mean/std, got {} and {}",
                mean.len(),
                std.len()
            )));
        }
        if std.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(IcarlError::Config("normalize std must be positive".into()));
        }
        Ok(Self { mean, std })
    }

    fn stats(&self, device: &Device) -> Result<(Tensor, Tensor)> {
        let c = self.mean.len();
        let mean = Tensor::from_slice(&self.mean, (c, 1, 1), device)?;
        let std = Tensor::from_slice(&self.std, (c, 1, 1), device)?;
        Ok((mean, std))
    }
}

impl ImageTransform for Normalize {
    fn apply(&self, image: &Tensor) -> Result<Tensor> {
        let (c, _, _) = image.dims3()?;
        if c != self.mean.len() {
            return Err(IcarlError::Shape {
                expected: format!("{} channels", self.mean.len()),
                actual: format!("{:?}", image.dims()),
            });
        }
        let (mean, std) = self.stats(image.device())?;
        let image = image.to_dtype(candle_core::DType::F32)?;
        Ok(image.broadcast_sub(&mean)?.broadcast_div(&std)?)
    }
}

// =============================================================================
// IN-MEMORY IMAGE DATASET
// =============================================================================

/// In-memory image dataset with a fixed source and optional transform
#[derive(Clone)]
pub struct ImageDataset {
    source: DatasetSource,
    images: Vec<Tensor>,
    labels: Vec<u32>,
    transform: Option<Arc<dyn ImageTransform>>,
}

impl std::fmt::Debug for ImageDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageDataset")
            .field("source", &self.source.name)
            .field("len", &self.images.len())
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl ImageDataset {
    /// Create from decoded images and labels
    pub fn new(source: DatasetSource, images: Vec<Tensor>, labels: Vec<u32>) -> Result<Self> {
        check_pairs(&images, &labels)?;
        if let Some(bad) = labels.iter().find(|&&l| l as usize >= source.num_classes) {
            return Err(IcarlError::Dataset(format!(
                "label {} out of range for {} ({} classes)",
                bad, source.name, source.num_classes
            )));
        }
        Ok(Self {
            source,
            images,
            labels,
            transform: None,
        })
    }

    /// Builder: apply `transform` on every indexed read
    pub fn with_transform(mut self, transform: impl ImageTransform + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    /// Keep only examples whose label is in `classes`, preserving order
    pub fn retain_classes(mut self, classes: &[u32]) -> Self {
        let keep: BTreeSet<u32> = classes.iter().copied().collect();
        let (images, labels) = self
            .images
            .into_iter()
            .zip(self.labels)
            .filter(|(_, label)| keep.contains(label))
            .unzip();
        self.images = images;
        self.labels = labels;
        self
    }

    /// Source metadata
    pub fn source(&self) -> &DatasetSource {
        &self.source
    }
}

impl IncrementalDataset for ImageDataset {
    fn len(&self) -> usize {
        self.images.len()
    }

    fn get(&self, index: usize) -> Result<Sample> {
        let raw = self.images.get(index).ok_or_else(|| {
            IcarlError::Dataset(format!(
                "index {} out of bounds for dataset of {}",
                index,
                self.images.len()
            ))
        })?;
        let image = match &self.transform {
            Some(t) => t.apply(raw)?,
            None => raw.clone(),
        };
        Ok(Sample {
            index,
            image,
            label: self.labels[index],
        })
    }

    fn labels(&self) -> &[u32] {
        &self.labels
    }

    fn images_of_class(&self, label: u32) -> Vec<Tensor> {
        self.images
            .iter()
            .zip(&self.labels)
            .filter(|(_, l)| **l == label)
            .map(|(img, _)| img.clone())
            .collect()
    }

    fn append(&mut self, images: Vec<Tensor>, labels: Vec<u32>) -> Result<()> {
        check_pairs(&images, &labels)?;
        self.images.extend(images);
        self.labels.extend(labels);
        Ok(())
    }

    fn transform(&self) -> Arc<dyn ImageTransform> {
        self.transform
            .clone()
            .unwrap_or_else(|| Arc::new(Identity) as Arc<dyn ImageTransform>)
    }
}

fn check_pairs(images: &[Tensor], labels: &[u32]) -> Result<()> {
    if images.len() != labels.len() {
        return Err(IcarlError::Dataset(format!(
            "{} images but {} labels",
            images.len(),
            labels.len()
        )));
    }
    if let Some(first) = images.first() {
        let dims = first.dims();
        if let Some(bad) = images.iter().find(|img| img.dims() != dims) {
            return Err(IcarlError::Shape {
                expected: format!("{:?}", dims),
                actual: format!("{:?}", bad.dims()),
            });
        }
    }
    Ok(())
}
