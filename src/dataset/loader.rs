//! Minibatch iteration
//!
//! Deterministic minibatching over an [`IncrementalDataset`]. Callers pass the
//! visiting order explicitly: sequential for soft-target snapshots and
//! feature extraction, a seeded shuffle for training epochs.

use candle_core::Tensor;
use rand::seq::SliceRandom;
use rand::Rng;

use super::IncrementalDataset;
use crate::{IcarlError, Result};

/// A stacked minibatch
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset index of every row
    pub indices: Vec<usize>,
    /// Transformed images, `(b, C, H, W)`
    pub images: Tensor,
    /// Labels, `(b,)` `u32`
    pub labels: Tensor,
}

impl Batch {
    /// Number of rows
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// Dataset indices as a `u32` tensor on the images' device, for `index_select`
    pub fn index_tensor(&self) -> Result<Tensor> {
        let ids: Vec<u32> = self.indices.iter().map(|&i| i as u32).collect();
        Tensor::from_vec(ids, self.indices.len(), self.images.device())
            .map_err(|e| IcarlError::Tensor(format!("index tensor failed: {}", e)))
    }
}

/// A random permutation of `0..len`
pub fn shuffled_order<R: Rng + ?Sized>(len: usize, rng: &mut R) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    order.shuffle(rng);
    order
}

/// Iterate `dataset` in `order`, `batch_size` examples at a time.
///
/// The final batch may be short. Every batch is read through
/// [`IncrementalDataset::get`], so the dataset transform applies.
pub fn batches<'a, D>(
    dataset: &'a D,
    order: &'a [usize],
    batch_size: usize,
) -> impl Iterator<Item = Result<Batch>> + 'a
where
    D: IncrementalDataset + ?Sized,
{
    order
        .chunks(batch_size.max(1))
        .map(move |chunk| load_batch(dataset, chunk))
}

fn load_batch<D: IncrementalDataset + ?Sized>(dataset: &D, chunk: &[usize]) -> Result<Batch> {
    let mut images = Vec::with_capacity(chunk.len());
    let mut labels = Vec::with_capacity(chunk.len());
    for &index in chunk {
        let sample = dataset.get(index)?;
        images.push(sample.image);
        labels.push(sample.label);
    }

    let images = Tensor::stack(&images, 0)
        .map_err(|e| IcarlError::Dataset(format!("failed to stack batch: {}", e)))?;
    let labels = Tensor::from_vec(labels, chunk.len(), images.device())?;

    Ok(Batch {
        indices: chunk.to_vec(),
        images,
        labels,
    })
}
