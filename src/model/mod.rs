//! Incremental Learner
//!
//! [`IcarlNet`] ties the pieces together: a caller-supplied feature
//! extractor, a batch-normalised ReLU bridge, the growable head, the
//! exemplar memory and the class-mean cache.
//!
//! ```text
//! images ─► extractor ─► batch-norm ─► relu ─► head ─► logits      (training)
//!              │
//!              └──────► L2-normalise ─► nearest class mean ─► label (inference)
//! ```
//!
//! ## Session protocol
//!
//! Each call to [`IcarlNet::learn_session`] runs to completion:
//!
//! 1. grow the head for labels not seen before
//! 2. fuse stored exemplars into the session dataset
//! 3. snapshot pre-update sigmoid outputs as distillation targets
//! 4. train for `epochs_per_session` epochs
//! 5. shrink old exemplar sets to the new per-class budget
//! 6. select exemplars by herding for the new classes, and for known
//!    classes that had no data until this session
//! 7. mark the new classes known
//!
//! Steps 1-4 are [`IcarlNet::update_representation`] and may be driven
//! separately.
//!
//! ## Example
//!
//! ```rust,ignore
//! use an_icarl::prelude::*;
//!
//! let device = best_device();
//! let config = IcarlConfig::default().with_feature_size(64).with_total_memory(2000);
//! let extractor = MlpExtractor::new(3 * 32 * 32, 256, 64, config.seed, &device)?;
//! let mut net = IcarlNet::new(extractor, 1, config, &device)?;
//!
//! for classes in (0..100).collect::<Vec<u32>>().chunks(10) {
//!     let mut train = ImageDataset::new(CIFAR100, images.clone(), labels.clone())?.retain_classes(classes);
//!     net.learn_session(&mut train)?;
//!     println!("accuracy: {:.3}", net.accuracy(&test)?);
//! }
//! ```

mod session;

use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;

use crate::config::IcarlConfig;
use crate::dataset::{batches, ImageTransform, IncrementalDataset};
use crate::extractor::{embed_checked, EvalScope, FeatureExtractor, FeatureNorm, Mode};
use crate::head::IncrementalHead;
use crate::memory::ExemplarStore;
use crate::ncm::ClassMeans;
use crate::primitives::relu;
use crate::training::{AdamOptimizer, AdamParams, MetricsTracker, SessionReport};
use crate::{IcarlError, Result};

/// Class-incremental classifier with exemplar memory
pub struct IcarlNet<E: FeatureExtractor> {
    extractor: E,
    norm: FeatureNorm,
    head: IncrementalHead,
    n_known: usize,
    exemplars: ExemplarStore,
    means: ClassMeans,
    optimizer: AdamOptimizer,
    config: IcarlConfig,
    rng: ChaCha8Rng,
    tracker: MetricsTracker,
    sessions: usize,
}

impl<E: FeatureExtractor> IcarlNet<E> {
    /// Build a learner whose head starts with `n_classes` outputs.
    ///
    /// No class is known until the first session completes.
    pub fn new(extractor: E, n_classes: usize, config: IcarlConfig, device: &Device) -> Result<Self> {
        config.validate()?;
        if extractor.feature_size() != config.feature_size {
            return Err(IcarlError::Config(format!(
                "extractor produces {} features but feature_size is {}",
                extractor.feature_size(),
                config.feature_size
            )));
        }

        let norm = FeatureNorm::new(config.feature_size, config.bn_momentum, device)?;
        let head = IncrementalHead::new(config.feature_size, n_classes, device)?;

        let mut vars = extractor.trainable_vars();
        vars.extend(norm.trainable_vars());
        vars.push(head.weight().clone());
        let optimizer = AdamOptimizer::new(
            vars,
            AdamParams {
                lr: config.learning_rate,
                weight_decay: config.weight_decay,
                ..Default::default()
            },
        )?;

        info!(
            "iCaRL learner: {} features, {} initial outputs, lr {}",
            config.feature_size, n_classes, config.learning_rate
        );

        Ok(Self {
            extractor,
            norm,
            head,
            n_known: 0,
            exemplars: ExemplarStore::new(),
            means: ClassMeans::new(),
            optimizer,
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            config,
            tracker: MetricsTracker::new(),
            sessions: 0,
        })
    }

    /// Logits `(b, n_classes)` for transformed images `(b, C, H, W)`
    pub fn forward(&self, images: &Tensor, mode: Mode) -> Result<Tensor> {
        let features = embed_checked(&self.extractor, images, mode)?;
        let hidden = relu(&self.norm.forward(&features, mode)?)?;
        self.head.forward(&hidden)
    }

    /// Add `n` output classes. Optimizer state follows the grown head.
    pub fn increment_classes(&mut self, n: usize) -> Result<()> {
        if let Some(old) = self.head.increment_classes(n)? {
            self.optimizer.regrow(&old, self.head.weight().clone())?;
        }
        Ok(())
    }

    /// Herd up to `m` exemplars for the next class from its raw `images`.
    pub fn construct_exemplar_set(
        &mut self,
        images: &[Tensor],
        m: usize,
        transform: &dyn ImageTransform,
    ) -> Result<u32> {
        self.means.invalidate();
        let scope = EvalScope::new(&self.extractor);
        let batch_size = self.config.batch_size;
        self.exemplars
            .construct_exemplar_set(images, m, |imgs| scope.extract(imgs, transform, batch_size))
    }

    /// Build the set of class `label`, which must be the next class or one
    /// whose set is still empty.
    pub fn fill_exemplar_set(
        &mut self,
        label: u32,
        images: &[Tensor],
        m: usize,
        transform: &dyn ImageTransform,
    ) -> Result<()> {
        self.means.invalidate();
        let scope = EvalScope::new(&self.extractor);
        let batch_size = self.config.batch_size;
        self.exemplars
            .fill_exemplar_set(label, images, m, |imgs| scope.extract(imgs, transform, batch_size))
    }

    /// Keep the first `m` exemplars of every class
    pub fn reduce_exemplar_sets(&mut self, m: usize) {
        self.means.invalidate();
        self.exemplars.reduce_exemplar_sets(m);
    }

    /// Append every stored exemplar to `dataset`. Once per session.
    pub fn combine_dataset_with_exemplars<D>(&self, dataset: &mut D) -> Result<usize>
    where
        D: IncrementalDataset + ?Sized,
    {
        self.exemplars.combine_dataset_with_exemplars(dataset)
    }

    /// Nearest-class-mean labels for transformed `images`.
    ///
    /// `transform` is applied to stored exemplars when the class means have to
    /// be recomputed; it should match the one that produced `images`.
    pub fn classify(&self, images: &Tensor, transform: &dyn ImageTransform) -> Result<Vec<u32>> {
        let scope = EvalScope::new(&self.extractor);
        let features = scope.embed(images)?;
        let batch_size = self.config.batch_size;
        self.means.classify(&features, &self.exemplars, self.n_known, |imgs| {
            scope.extract(imgs, transform, batch_size)
        })
    }

    /// Fraction of `dataset` classified correctly
    pub fn accuracy<D>(&self, dataset: &D) -> Result<f32>
    where
        D: IncrementalDataset + ?Sized,
    {
        if dataset.is_empty() {
            return Err(IcarlError::Dataset("cannot evaluate on an empty dataset".into()));
        }

        let transform = dataset.transform();
        let order: Vec<usize> = (0..dataset.len()).collect();
        let mut correct = 0usize;
        for batch in batches(dataset, &order, self.config.batch_size) {
            let batch = batch?;
            let preds = self.classify(&batch.images, &*transform)?;
            let labels = batch.labels.to_vec1::<u32>()?;
            correct += preds.iter().zip(&labels).filter(|(p, l)| p == l).count();
        }
        Ok(correct as f32 / dataset.len() as f32)
    }

    /// Run one complete incremental session on `dataset`.
    ///
    /// `dataset` is extended with the stored exemplars during the call.
    pub fn learn_session<D>(&mut self, dataset: &mut D) -> Result<SessionReport>
    where
        D: IncrementalDataset + ?Sized,
    {
        let report = self.update_representation(dataset)?;

        let m = self.config.exemplars_per_class(self.n_classes());
        self.reduce_exemplar_sets(m);

        // new classes, plus known classes still waiting for their first data
        let transform = dataset.transform();
        let session_classes = dataset.classes();
        for label in 0..self.n_classes() as u32 {
            let needs_set = match self.exemplars.get(label) {
                None => true,
                Some(set) => set.is_empty() && session_classes.contains(&label),
            };
            if needs_set {
                let images = dataset.images_of_class(label);
                self.fill_exemplar_set(label, &images, m, &*transform)?;
            }
        }

        self.mark_classes_known();
        info!(
            "session {} done: {} known classes, {} exemplars ({} per class)",
            report.session,
            self.n_known,
            self.exemplars.total_exemplars(),
            m
        );
        Ok(report)
    }

    /// Treat every output class as known
    pub fn mark_classes_known(&mut self) {
        self.n_known = self.n_classes();
    }

    /// Output width of the head
    pub fn n_classes(&self) -> usize {
        self.head.out_features()
    }

    /// Leading outputs treated as known classes
    pub fn n_known(&self) -> usize {
        self.n_known
    }

    /// Completed `update_representation` calls
    pub fn sessions(&self) -> usize {
        self.sessions
    }

    /// Exemplar memory
    pub fn exemplars(&self) -> &ExemplarStore {
        &self.exemplars
    }

    /// Class-mean cache
    pub fn class_means(&self) -> &ClassMeans {
        &self.means
    }

    /// Feature extractor
    pub fn extractor(&self) -> &E {
        &self.extractor
    }

    /// Feature batch-norm
    pub fn norm(&self) -> &FeatureNorm {
        &self.norm
    }

    /// Classifier head
    pub fn head(&self) -> &IncrementalHead {
        &self.head
    }

    /// Session optimizer
    pub fn optimizer(&self) -> &AdamOptimizer {
        &self.optimizer
    }

    /// Loss history across sessions
    pub fn metrics(&self) -> &MetricsTracker {
        &self.tracker
    }

    /// Active configuration
    pub fn config(&self) -> &IcarlConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{ImageDataset, CIFAR10};
    use crate::extractor::MlpExtractor;
    use candle_core::{DType, Var};
    use rand::Rng;
    use std::sync::atomic::{AtomicBool, Ordering};

    const FEATURES: usize = 6;

    fn config() -> IcarlConfig {
        IcarlConfig::default()
            .with_feature_size(FEATURES)
            .with_memory_budget(3)
            .with_epochs(2)
            .with_batch_size(4)
            .with_learning_rate(0.01)
            .with_seed(7)
    }

    fn net(n_classes: usize) -> IcarlNet<MlpExtractor> {
        let extractor = MlpExtractor::new(4, 8, FEATURES, 7, &Device::Cpu).unwrap();
        IcarlNet::new(extractor, n_classes, config(), &Device::Cpu).unwrap()
    }

    /// `per_class` noisy (1, 2, 2) images around a class-specific pattern
    fn session(classes: &[u32], per_class: usize, seed: u64) -> ImageDataset {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut images = Vec::new();
        let mut labels = Vec::new();
        for &c in classes {
            for _ in 0..per_class {
                let values: Vec<f32> = (0..4)
                    .map(|j| {
                        let centre = if j == (c as usize % 4) { 3.0 } else { 0.0 };
                        centre + c as f32 * 0.5 + rng.gen_range(-0.2..0.2)
                    })
                    .collect();
                images.push(Tensor::from_vec(values, (1, 2, 2), &Device::Cpu).unwrap());
                labels.push(c);
            }
        }
        ImageDataset::new(CIFAR10, images, labels).unwrap()
    }

    #[test]
    fn test_new_rejects_feature_size_mismatch() {
        let extractor = MlpExtractor::new(4, 8, 5, 0, &Device::Cpu).unwrap();
        let result = IcarlNet::new(extractor, 1, config(), &Device::Cpu);
        assert!(matches!(result, Err(IcarlError::Config(_))));
    }

    #[test]
    fn test_forward_shape() {
        let net = net(3);
        let images = Tensor::ones((5, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let logits = net.forward(&images, Mode::Eval).unwrap();
        assert_eq!(logits.dims(), &[5, 3]);
    }

    #[test]
    fn test_increment_classes_grows_head_and_optimizer() {
        let mut net = net(2);
        net.increment_classes(3).unwrap();
        assert_eq!(net.n_classes(), 5);
        let head_id = net.head().weight().as_tensor().id();
        assert!(net
            .optimizer()
            .vars()
            .iter()
            .any(|v| v.as_tensor().id() == head_id));

        net.increment_classes(0).unwrap();
        assert_eq!(net.n_classes(), 5);
    }

    #[test]
    fn test_first_session_skips_distillation() {
        let mut net = net(1);
        let mut data = session(&[0, 1, 2], 4, 1);
        let report = net.update_representation(&mut data).unwrap();

        assert_eq!(report.new_classes, 2);
        assert_eq!(report.n_classes, 3);
        assert_eq!(report.exemplars_fused, 0);
        assert_eq!(report.fused_len, 12);
        assert_eq!(report.epochs.len(), 2);
        assert!(report.epochs.iter().all(|e| e.distillation_loss.is_none()));
        assert!(report.final_loss.is_finite());
        let mean = report.mean_loss.unwrap();
        assert!(mean.is_finite());
        assert!(report.best_loss.unwrap() <= mean);
        // n_known only moves once exemplars exist
        assert_eq!(net.n_known(), 0);
    }

    #[test]
    fn test_learn_session_builds_memory_and_classifies() {
        let mut net = net(1);
        let mut data = session(&[0, 1, 2], 5, 2);
        net.learn_session(&mut data).unwrap();

        assert_eq!(net.n_known(), 3);
        assert_eq!(net.exemplars().num_classes(), 3);
        assert!(net.exemplars().sets().iter().all(|s| s.len() == 3));

        let test = session(&[0, 1, 2], 2, 3);
        let acc = net.accuracy(&test).unwrap();
        assert!((0.0..=1.0).contains(&acc));

        let images = Tensor::ones((2, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let preds = net.classify(&images, &crate::dataset::Identity).unwrap();
        assert!(preds.iter().all(|&p| p < 3));
    }

    #[test]
    fn test_second_session_fuses_exemplars_and_distils() {
        let mut net = net(1);
        net.learn_session(&mut session(&[0, 1, 2], 4, 4)).unwrap();
        let stored = net.exemplars().total_exemplars();

        let mut data = session(&[3, 4], 4, 5);
        let report = net.learn_session(&mut data).unwrap();

        assert_eq!(report.session, 1);
        assert_eq!(report.new_classes, 2);
        assert_eq!(report.exemplars_fused, stored);
        assert_eq!(report.fused_len, 8 + stored);
        assert!(report.epochs.iter().all(|e| e.distillation_loss.is_some()));
        assert_eq!(net.n_known(), 5);
        assert_eq!(net.exemplars().num_classes(), 5);
        assert_eq!(net.sessions(), 2);
    }

    #[test]
    fn test_wide_head_fills_sets_when_classes_arrive() {
        let mut net = net(4);
        let images = Tensor::ones((3, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();

        net.learn_session(&mut session(&[0, 1], 4, 13)).unwrap();
        assert_eq!(net.n_known(), 4);
        let sizes: Vec<usize> = net.exemplars().sets().iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![3, 3, 0, 0]);
        // classes without exemplars are never predicted
        let preds = net.classify(&images, &crate::dataset::Identity).unwrap();
        assert!(preds.iter().all(|&p| p < 2));

        let report = net.learn_session(&mut session(&[2, 3], 4, 14)).unwrap();
        assert_eq!(report.new_classes, 0);
        assert_eq!(report.exemplars_fused, 6);
        assert_eq!(net.n_classes(), 4);
        let sizes: Vec<usize> = net.exemplars().sets().iter().map(|s| s.len()).collect();
        assert_eq!(sizes, vec![3, 3, 3, 3]);

        let preds = net.classify(&images, &crate::dataset::Identity).unwrap();
        assert!(preds.iter().all(|&p| p < 4));
        let acc = net.accuracy(&session(&[0, 1, 2, 3], 2, 15)).unwrap();
        assert!((0.0..=1.0).contains(&acc));
    }

    /// Reference extractor that can be switched to emit NaN features
    struct Poisonable {
        inner: MlpExtractor,
        poisoned: AtomicBool,
    }

    impl FeatureExtractor for Poisonable {
        fn feature_size(&self) -> usize {
            self.inner.feature_size()
        }

        fn embed(&self, images: &Tensor, mode: Mode) -> Result<Tensor> {
            let features = self.inner.embed(images, mode)?;
            if self.poisoned.load(Ordering::Relaxed) {
                Ok((features * f64::NAN)?)
            } else {
                Ok(features)
            }
        }

        fn trainable_vars(&self) -> Vec<Var> {
            self.inner.trainable_vars()
        }
    }

    #[test]
    fn test_non_finite_training_aborts_session() {
        let extractor = Poisonable {
            inner: MlpExtractor::new(4, 8, FEATURES, 7, &Device::Cpu).unwrap(),
            poisoned: AtomicBool::new(false),
        };
        let mut net = IcarlNet::new(extractor, 1, config(), &Device::Cpu).unwrap();
        net.learn_session(&mut session(&[0, 1], 4, 16)).unwrap();
        let stored = net.exemplars().total_exemplars();

        net.extractor().poisoned.store(true, Ordering::Relaxed);
        let result = net.learn_session(&mut session(&[2, 3], 4, 17));

        assert!(matches!(result, Err(IcarlError::Training(_))));
        assert_eq!(net.n_known(), 2);
        assert_eq!(net.sessions(), 1);
        assert_eq!(net.exemplars().num_classes(), 2);
        assert_eq!(net.exemplars().total_exemplars(), stored);
    }

    #[test]
    fn test_total_memory_budget_shrinks_old_sets() {
        let extractor = MlpExtractor::new(4, 8, FEATURES, 7, &Device::Cpu).unwrap();
        let cfg = config().with_total_memory(12);
        let mut net = IcarlNet::new(extractor, 1, cfg, &Device::Cpu).unwrap();

        net.learn_session(&mut session(&[0, 1, 2], 5, 6)).unwrap();
        assert!(net.exemplars().sets().iter().all(|s| s.len() == 4));

        net.learn_session(&mut session(&[3, 4, 5], 5, 7)).unwrap();
        assert!(net.exemplars().sets().iter().all(|s| s.len() == 2));
        assert_eq!(net.exemplars().total_exemplars(), 12);
    }

    #[test]
    fn test_gapped_new_classes_rejected() {
        let mut net = net(1);
        let mut data = session(&[0, 5], 2, 8);
        let result = net.update_representation(&mut data);
        assert!(matches!(result, Err(IcarlError::Config(_))));
        assert_eq!(net.n_classes(), 1);
    }

    #[test]
    fn test_empty_session_rejected() {
        let mut net = net(1);
        let mut data = ImageDataset::new(CIFAR10, vec![], vec![]).unwrap();
        assert!(matches!(
            net.update_representation(&mut data),
            Err(IcarlError::Dataset(_))
        ));
    }

    #[test]
    fn test_means_recomputed_once_per_training() {
        let mut net = net(1);
        net.learn_session(&mut session(&[0, 1], 4, 9)).unwrap();
        let images = Tensor::ones((3, 1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let before = net.class_means().recomputations();

        for _ in 0..3 {
            net.classify(&images, &crate::dataset::Identity).unwrap();
        }
        assert_eq!(net.class_means().recomputations(), before + 1);

        net.update_representation(&mut session(&[0, 1], 2, 10)).unwrap();
        assert!(!net.class_means().is_valid());
        net.classify(&images, &crate::dataset::Identity).unwrap();
        net.classify(&images, &crate::dataset::Identity).unwrap();
        assert_eq!(net.class_means().recomputations(), before + 2);
    }

    #[test]
    fn test_snapshot_is_eval_mode_and_detached() {
        let net = net(3);
        let data = session(&[0, 1, 2], 3, 11);
        let (mean_before, var_before) = net.norm().running_stats();

        let q = net.soft_targets(&data).unwrap();
        assert_eq!(q.dims(), &[9, 3]);
        let grads = q.sum_all().unwrap().backward().unwrap();
        assert!(net
            .optimizer()
            .vars()
            .iter()
            .all(|v| grads.get(v.as_tensor()).is_none()));
        for row in q.to_vec2::<f32>().unwrap() {
            assert!(row.iter().all(|&v| v > 0.0 && v < 1.0));
        }

        let (mean_after, var_after) = net.norm().running_stats();
        assert_eq!(
            mean_before.to_vec1::<f32>().unwrap(),
            mean_after.to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            var_before.to_vec1::<f32>().unwrap(),
            var_after.to_vec1::<f32>().unwrap()
        );
    }

    #[test]
    fn test_sessions_are_deterministic_for_a_seed() {
        let run = || {
            let mut net = net(1);
            let report = net.learn_session(&mut session(&[0, 1, 2], 4, 12)).unwrap();
            (report.final_loss, net.exemplars().total_exemplars())
        };
        let (a_loss, a_count) = run();
        let (b_loss, b_count) = run();
        assert!((a_loss - b_loss).abs() < 1e-5);
        assert_eq!(a_count, b_count);
    }
}
