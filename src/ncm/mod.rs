//! Nearest-Class-Mean Classification
//!
//! The inference-time classifier. Each known class is summarised by the
//! normalised mean of its exemplars' normalised features; an input goes to
//! the class whose mean is closest in squared Euclidean distance. The trained
//! linear head is not consulted. A known class whose exemplar set is empty
//! has no mean and is never predicted.
//!
//! ## Cache
//!
//! [`ClassMeans`] holds the means behind a validity flag. Invalidation only
//! flips the flag; the next classification recomputes every known class in
//! full under an exclusive lock, and later calls reuse the result until the
//! next invalidation.
//!
//! ```text
//! invalidate() ──► stale ──classify()──► recompute all ──► valid ──classify()──► reuse
//! ```

use candle_core::Tensor;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::memory::ExemplarStore;
use crate::primitives::{l2_normalize, l2_normalize_rows, squared_distances};
use crate::{IcarlError, Result};

/// Stacked class means, row `i` belonging to class `labels[i]`
#[derive(Debug, Clone)]
pub struct MeanTable {
    /// `(classes with exemplars, d)` unit-norm means
    pub means: Tensor,
    /// Class label of each row, ascending
    pub labels: Vec<u32>,
}

#[derive(Debug, Default)]
struct MeansState {
    table: Option<MeanTable>,
    n_known: usize,
    valid: bool,
    recomputations: u64,
}

impl MeansState {
    fn current(&self, n_known: usize) -> Option<&MeanTable> {
        if self.valid && self.n_known == n_known {
            self.table.as_ref()
        } else {
            None
        }
    }
}

/// Lazily recomputed per-class exemplar means
#[derive(Debug, Default)]
pub struct ClassMeans {
    state: RwLock<MeansState>,
}

impl ClassMeans {
    /// Empty, invalid cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the cached means stale
    pub fn invalidate(&self) {
        self.state.write().valid = false;
    }

    /// Whether the cached means can be used as-is
    pub fn is_valid(&self) -> bool {
        let state = self.state.read();
        state.valid && state.table.is_some()
    }

    /// How many full recomputations have run
    pub fn recomputations(&self) -> u64 {
        self.state.read().recomputations
    }

    /// Cached means, if valid
    pub fn cached(&self) -> Option<MeanTable> {
        let state = self.state.read();
        if state.valid {
            state.table.clone()
        } else {
            None
        }
    }

    /// Cached means for `n_known` classes, recomputing all of them if stale.
    pub fn get_or_compute<F>(
        &self,
        store: &ExemplarStore,
        n_known: usize,
        feature_fn: F,
    ) -> Result<MeanTable>
    where
        F: FnMut(&[Tensor]) -> Result<Tensor>,
    {
        if let Some(table) = self.state.read().current(n_known) {
            return Ok(table.clone());
        }

        let mut state = self.state.write();
        if let Some(table) = state.current(n_known) {
            return Ok(table.clone());
        }

        info!("computing means of exemplars for {} classes", n_known);
        let table = compute_class_means(store, n_known, feature_fn)?;
        state.table = Some(table.clone());
        state.n_known = n_known;
        state.valid = true;
        state.recomputations += 1;
        Ok(table)
    }

    /// Classify raw features `(b, d)` against the means of `n_known` classes.
    pub fn classify<F>(
        &self,
        features: &Tensor,
        store: &ExemplarStore,
        n_known: usize,
        feature_fn: F,
    ) -> Result<Vec<u32>>
    where
        F: FnMut(&[Tensor]) -> Result<Tensor>,
    {
        let table = self.get_or_compute(store, n_known, feature_fn)?;
        let rows = nearest_class(&l2_normalize_rows(features)?, &table.means)?;
        Ok(rows.into_iter().map(|r| table.labels[r as usize]).collect())
    }
}

/// Normalised exemplar mean of every class in `0..n_known` that has exemplars.
///
/// Classes with an empty set are left out of the table. Fails when no known
/// class has any exemplar.
pub fn compute_class_means<F>(
    store: &ExemplarStore,
    n_known: usize,
    mut feature_fn: F,
) -> Result<MeanTable>
where
    F: FnMut(&[Tensor]) -> Result<Tensor>,
{
    if n_known == 0 {
        return Err(IcarlError::Memory("no known classes to classify against".into()));
    }
    if store.num_classes() < n_known {
        return Err(IcarlError::Memory(format!(
            "{} known classes but exemplar sets for only {}",
            n_known,
            store.num_classes()
        )));
    }

    let mut means = Vec::with_capacity(n_known);
    let mut labels = Vec::with_capacity(n_known);
    for (label, set) in store.sets().iter().take(n_known).enumerate() {
        if set.is_empty() {
            debug!("class {} has no exemplars, left out of the means", label);
            continue;
        }
        let features = l2_normalize_rows(&feature_fn(set.images())?)?;
        means.push(l2_normalize(&features.mean(0)?)?);
        labels.push(label as u32);
    }
    if means.is_empty() {
        return Err(IcarlError::Memory(format!(
            "none of the {} known classes has exemplars",
            n_known
        )));
    }

    let means = Tensor::stack(&means, 0)
        .map_err(|e| IcarlError::Tensor(format!("mean stack failed: {}", e)))?;
    Ok(MeanTable { means, labels })
}

/// Index of the nearest mean for every row of `features`.
///
/// Both inputs are expected unit-norm. Equal distances resolve to the lowest
/// class index.
pub fn nearest_class(features: &Tensor, means: &Tensor) -> Result<Vec<u32>> {
    let dists = squared_distances(features, means)?.to_vec2::<f32>()?;
    dists
        .iter()
        .map(|row| {
            let mut best = 0usize;
            for (class, &d) in row.iter().enumerate() {
                if !d.is_finite() {
                    return Err(IcarlError::Computation(format!(
                        "distance to class {} is not finite",
                        class
                    )));
                }
                if d < row[best] {
                    best = class;
                }
            }
            Ok(best as u32)
        })
        .collect()
}
