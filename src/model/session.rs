//! Representation update: grow, fuse, snapshot, train

use std::time::Instant;

use candle_core::Tensor;
use tracing::{debug, info};

use super::IcarlNet;
use crate::dataset::{batches, shuffled_order, IncrementalDataset};
use crate::extractor::{FeatureExtractor, Mode};
use crate::primitives::{ensure_finite, sigmoid};
use crate::training::{
    compute_grad_norm, ensure_gradients_finite, session_loss, SessionReport, TrainingMetrics,
};
use crate::{IcarlError, Result};

impl<E: FeatureExtractor> IcarlNet<E> {
    /// Train the network on a new session's data.
    ///
    /// Labels `>= n_classes` are the session's new classes and must be
    /// contiguous. Stored exemplars are appended to `dataset`, distillation
    /// targets are snapshotted from the untouched network, then the whole
    /// fused set is trained on for `epochs_per_session` epochs. `n_known` is
    /// left for the caller to advance.
    ///
    /// A non-finite loss or gradient aborts the session with
    /// [`IcarlError::Training`]; parameters updated before the fault stay
    /// updated.
    pub fn update_representation<D>(&mut self, dataset: &mut D) -> Result<SessionReport>
    where
        D: IncrementalDataset + ?Sized,
    {
        if dataset.is_empty() {
            return Err(IcarlError::Dataset("session dataset is empty".into()));
        }
        self.means.invalidate();

        // 1. grow the head
        let known_outputs = self.n_classes();
        let new_classes: Vec<u32> = dataset
            .classes()
            .into_iter()
            .filter(|&c| c as usize >= known_outputs)
            .collect();
        if let Some(old) = self.head.add_classes(&new_classes)? {
            self.optimizer.regrow(&old, self.head.weight().clone())?;
        }
        info!("{} new classes", new_classes.len());

        // 2. fuse exemplars
        let exemplars_fused = self.exemplars.combine_dataset_with_exemplars(dataset)?;
        let fused_len = dataset.len();
        info!(
            "training on {} examples ({} exemplars of {} known classes)",
            fused_len, exemplars_fused, self.n_known
        );

        // 3. snapshot distillation targets
        let q = self.soft_targets(&*dataset)?;
        debug!("soft targets {:?}", q.dims());

        // 4. optimise
        let n_known = self.n_known;
        let epochs = self.config.epochs_per_session;
        let batch_size = self.config.batch_size;
        let log_every = self.config.log_every;
        let iters_per_epoch = fused_len / batch_size;
        let vars = self.optimizer.vars();

        let mut steps = 0usize;
        let mut final_loss = f32::NAN;
        let mut epoch_metrics = Vec::with_capacity(epochs);

        for epoch in 0..epochs {
            let started = Instant::now();
            let order = shuffled_order(fused_len, &mut self.rng);
            let mut loss_sum = 0.0f32;
            let mut distill_sum = 0.0f32;
            let mut batches_seen = 0usize;

            for (i, batch) in batches(&*dataset, &order, batch_size).enumerate() {
                let batch = batch?;
                let logits = self.forward(&batch.images, Mode::Train)?;
                let targets = if n_known > 0 {
                    Some(q.index_select(&batch.index_tensor()?, 0)?)
                } else {
                    None
                };

                let loss = session_loss(&logits, &batch.labels, targets.as_ref(), n_known)?;
                let value = ensure_finite(&loss.total, "session loss").map_err(|e| {
                    IcarlError::Training(format!("epoch {}, iter {}: {}", epoch + 1, i + 1, e))
                })?;
                if let Some(d) = &loss.distillation {
                    distill_sum += d.to_scalar::<f32>()?;
                }

                let grads = loss.total.backward()?;
                ensure_gradients_finite(&grads, &vars)?;
                self.optimizer.step(&grads)?;

                self.tracker.record(value);
                loss_sum += value;
                batches_seen += 1;
                steps += 1;
                final_loss = value;

                if log_every > 0 && (i + 1) % log_every == 0 {
                    info!(
                        "Epoch [{}/{}], Iter [{}/{}] Loss: {:.4}",
                        epoch + 1,
                        epochs,
                        i + 1,
                        iters_per_epoch,
                        value
                    );
                    debug!("grad norm {:.4}", compute_grad_norm(&grads, &vars)?);
                }
            }

            let mean_loss = loss_sum / batches_seen.max(1) as f32;
            let mut metrics = TrainingMetrics::new(self.sessions, epoch as u64, mean_loss)
                .with_samples(fused_len)
                .with_duration_ms(started.elapsed().as_millis() as u64);
            if n_known > 0 {
                metrics = metrics.with_distillation(distill_sum / batches_seen.max(1) as f32);
            }
            info!("Epoch [{}/{}] mean loss {:.4}", epoch + 1, epochs, mean_loss);
            self.tracker.record_epoch(metrics.clone());
            epoch_metrics.push(metrics);
        }

        // 5. stale means
        self.means.invalidate();

        let mean_loss = self.tracker.average_loss(steps);
        let best_loss = self.tracker.best_loss();
        info!(
            "session {}: {} steps, mean loss {:?}, best loss so far {:?}",
            self.sessions, steps, mean_loss, best_loss
        );

        let report = SessionReport {
            session: self.sessions,
            new_classes: new_classes.len(),
            n_classes: self.n_classes(),
            exemplars_fused,
            fused_len,
            steps,
            final_loss,
            mean_loss,
            best_loss,
            epochs: epoch_metrics,
        };
        self.sessions += 1;
        Ok(report)
    }

    /// Sigmoid outputs `(len, n_classes)` of the current network for every
    /// example of `dataset`, row `i` for dataset index `i`.
    ///
    /// Runs in eval mode and detaches: batch-norm statistics are read, not
    /// updated, and no gradient reaches the parameters.
    pub(super) fn soft_targets<D>(&self, dataset: &D) -> Result<Tensor>
    where
        D: IncrementalDataset + ?Sized,
    {
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut rows = Vec::with_capacity(dataset.len().div_ceil(self.config.batch_size));
        for batch in batches(dataset, &order, self.config.batch_size) {
            let batch = batch?;
            let logits = self.forward(&batch.images, Mode::Eval)?.detach();
            rows.push(sigmoid(&logits)?);
        }
        Tensor::cat(&rows, 0).map_err(|e| IcarlError::Tensor(format!("soft target concat failed: {}", e)))
    }
}
