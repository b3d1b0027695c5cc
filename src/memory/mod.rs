//! Exemplar Memory
//!
//! Per-class, importance-ordered sets of retained training images.
//!
//! ## Ordering
//!
//! Herding appends exemplars in the order they best approximate the class
//! mean, so the earliest entries are the most representative. Reduction
//! therefore always keeps a prefix and never reorders.
//!
//! ## Herding Rule
//!
//! With all candidate features `φ` (L2-normalised), the normalised class mean
//! `μ` and the running sum `S` of already-selected features, step `k` scores
//! every candidate at once:
//!
//! ```text
//! μₚ = (φᵢ + S) / (k + 1),  μₚ ← μₚ / ‖μₚ‖,  i* = argminᵢ ‖μ − μₚ‖
//! ```
//!
//! restricted to candidates not selected yet, ties to the lowest index.
//! Selection stops at `m` or when the pool is exhausted.

use candle_core::Tensor;
use tracing::{debug, info};

use crate::dataset::IncrementalDataset;
use crate::primitives::{l2_normalize, l2_normalize_rows, squared_distances, NORM_EPS};
use crate::{IcarlError, Result};

/// Ordered exemplar images for one class, most representative first
#[derive(Debug, Clone, Default)]
pub struct ExemplarSet {
    images: Vec<Tensor>,
}

impl ExemplarSet {
    /// Wrap images already in importance order
    pub fn from_images(images: Vec<Tensor>) -> Self {
        Self { images }
    }

    /// Number of exemplars
    pub fn len(&self) -> usize {
        self.images.len()
    }

    /// Whether the set holds no exemplars
    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Exemplar images in importance order
    pub fn images(&self) -> &[Tensor] {
        &self.images
    }

    /// Keep the first `m` exemplars
    pub fn truncate(&mut self, m: usize) {
        self.images.truncate(m);
    }
}

/// Exemplar sets for every known class, indexed by class label
#[derive(Debug, Clone, Default)]
pub struct ExemplarStore {
    sets: Vec<ExemplarSet>,
}

impl ExemplarStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of classes with a (possibly empty) exemplar set
    pub fn num_classes(&self) -> usize {
        self.sets.len()
    }

    /// Exemplar set of class `label`
    pub fn get(&self, label: u32) -> Option<&ExemplarSet> {
        self.sets.get(label as usize)
    }

    /// All sets, in class order
    pub fn sets(&self) -> &[ExemplarSet] {
        &self.sets
    }

    /// Total exemplars held across classes
    pub fn total_exemplars(&self) -> usize {
        self.sets.iter().map(ExemplarSet::len).sum()
    }

    /// Select up to `m` exemplars from one new class's images by herding and
    /// append them as the next class's set.
    ///
    /// `feature_fn` maps raw images to raw `(n, d)` features without gradient
    /// tracking; rows are L2-normalised here. An empty pool yields an empty
    /// set. Returns the class index the set was stored under.
    pub fn construct_exemplar_set<F>(
        &mut self,
        images: &[Tensor],
        m: usize,
        feature_fn: F,
    ) -> Result<u32>
    where
        F: FnMut(&[Tensor]) -> Result<Tensor>,
    {
        let label = self.sets.len() as u32;
        self.fill_exemplar_set(label, images, m, feature_fn)?;
        Ok(label)
    }

    /// Build the set of class `label` by herding, as
    /// [`construct_exemplar_set`](Self::construct_exemplar_set) does.
    ///
    /// `label` is either the next class or a class whose stored set is still
    /// empty, which is replaced. A non-empty set is never overwritten.
    pub fn fill_exemplar_set<F>(
        &mut self,
        label: u32,
        images: &[Tensor],
        m: usize,
        mut feature_fn: F,
    ) -> Result<()>
    where
        F: FnMut(&[Tensor]) -> Result<Tensor>,
    {
        let slot = label as usize;
        match self.sets.get(slot) {
            Some(set) if !set.is_empty() => {
                return Err(IcarlError::Memory(format!(
                    "class {} already holds {} exemplars",
                    label,
                    set.len()
                )));
            }
            None if slot != self.sets.len() => {
                return Err(IcarlError::Memory(format!(
                    "exemplar store holds {} classes, cannot build class {}",
                    self.sets.len(),
                    label
                )));
            }
            _ => {}
        }

        let set = if images.is_empty() || m == 0 {
            debug!("class {}: empty exemplar set (pool {}, m {})", label, images.len(), m);
            ExemplarSet::default()
        } else {
            let features = l2_normalize_rows(&feature_fn(images)?)?;
            let (rows, _) = features.dims2()?;
            if rows != images.len() {
                return Err(IcarlError::Shape {
                    expected: format!("{} feature rows", images.len()),
                    actual: format!("{:?}", features.dims()),
                });
            }

            let order = herding_order(&features, m)?;
            info!(
                "class {}: selected {} exemplars from {} images",
                label,
                order.len(),
                images.len()
            );
            ExemplarSet::from_images(order.iter().map(|&i| images[i].clone()).collect())
        };

        if slot == self.sets.len() {
            self.sets.push(set);
        } else {
            self.sets[slot] = set;
        }
        Ok(())
    }

    /// Truncate every set to its first `m` exemplars
    pub fn reduce_exemplar_sets(&mut self, m: usize) {
        for (label, set) in self.sets.iter_mut().enumerate() {
            if set.len() > m {
                debug!("class {}: reducing exemplars {} -> {}", label, set.len(), m);
                set.truncate(m);
            }
        }
    }

    /// Append every stored exemplar, labelled with its class, to `dataset`.
    ///
    /// Call once per session: a second call appends the exemplars again.
    /// Returns the number of examples appended.
    pub fn combine_dataset_with_exemplars<D>(&self, dataset: &mut D) -> Result<usize>
    where
        D: IncrementalDataset + ?Sized,
    {
        let mut appended = 0;
        for (label, set) in self.sets.iter().enumerate() {
            if set.is_empty() {
                continue;
            }
            let labels = vec![label as u32; set.len()];
            dataset.append(set.images().to_vec(), labels)?;
            appended += set.len();
        }
        Ok(appended)
    }
}

/// Indices of the herding selection over normalised `features`, in
/// selection order, at most `m` long.
pub fn herding_order(features: &Tensor, m: usize) -> Result<Vec<usize>> {
    let (n, d) = features.dims2()?;
    let class_mean = l2_normalize(&features.mean(0)?)?.reshape((1, d))?;

    let mut selected: Vec<usize> = Vec::with_capacity(m.min(n));
    let mut taken = vec![false; n];
    let mut running_sum = Tensor::zeros((1, d), features.dtype(), features.device())?;

    for k in 0..m.min(n) {
        let mu_p = (features.broadcast_add(&running_sum)? / (k + 1) as f64)?;
        let norms = mu_p.sqr()?.sum_keepdim(1)?.sqrt()?;
        let norm_values = norms.flatten_all()?.to_vec1::<f32>()?;
        let mu_p = mu_p.broadcast_div(&norms.clamp(NORM_EPS, f32::MAX)?)?;

        let dists = squared_distances(&class_mean, &mu_p)?
            .flatten_all()?
            .to_vec1::<f32>()?;

        let mut best: Option<(usize, f32)> = None;
        for (i, &dist) in dists.iter().enumerate() {
            if taken[i] || norm_values[i] <= NORM_EPS || !dist.is_finite() {
                continue;
            }
            if best.map_or(true, |(_, b)| dist < b) {
                best = Some((i, dist));
            }
        }

        let (i, _) = best.ok_or_else(|| {
            IcarlError::Computation(format!(
                "herding step {}: every remaining candidate mean is degenerate",
                k
            ))
        })?;

        taken[i] = true;
        selected.push(i);
        running_sum = (running_sum + features.narrow(0, i, 1)?)?;
    }

    Ok(selected)
}
