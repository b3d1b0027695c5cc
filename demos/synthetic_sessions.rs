//! Two incremental sessions on synthetic images
//!
//! Demonstrates: learn classes 0-4 → learn classes 5-9 → NCM accuracy on
//! old and new classes
//!
//! Run with:
//! ```bash
//! cargo run --example synthetic_sessions
//! ```

use an_icarl::prelude::*;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const CHANNELS: usize = 3;
const SIDE: usize = 4;
const PIXELS: usize = CHANNELS * SIDE * SIDE;

/// Gaussian-ish blobs: each class lights up its own band of pixels
fn blobs(classes: &[u32], per_class: usize, rng: &mut ChaCha8Rng, device: &Device) -> Result<ImageDataset> {
    let mut images = Vec::new();
    let mut labels = Vec::new();
    for &class in classes {
        for _ in 0..per_class {
            let values: Vec<f32> = (0..PIXELS)
                .map(|p| {
                    let lit = p % 10 == class as usize;
                    let base = if lit { 1.0 } else { 0.0 };
                    base + rng.gen_range(-0.3f32..0.3)
                })
                .collect();
            images.push(Tensor::from_vec(values, (CHANNELS, SIDE, SIDE), device)?);
            labels.push(class);
        }
    }
    ImageDataset::new(CIFAR10, images, labels)
}

fn main() -> Result<()> {
    let device = best_device();
    let mut rng = ChaCha8Rng::seed_from_u64(42);

    // 1. Learner: small MLP extractor, fixed total exemplar budget
    let config = IcarlConfig::default()
        .with_feature_size(32)
        .with_total_memory(100)
        .with_epochs(10)
        .with_batch_size(25)
        .with_learning_rate(0.005);
    let extractor = MlpExtractor::new(PIXELS, 64, config.feature_size, config.seed, &device)?;
    let mut net = IcarlNet::new(extractor, 1, config, &device)?;

    let normalize = Normalize::new(vec![0.1; CHANNELS], vec![0.4; CHANNELS])?;
    let old_classes: Vec<u32> = (0..5).collect();
    let new_classes: Vec<u32> = (5..10).collect();

    // 2. Two sessions
    for (i, classes) in [&old_classes, &new_classes].into_iter().enumerate() {
        let mut train = blobs(classes, 40, &mut rng, &device)?.with_transform(normalize.clone());
        let report = net.learn_session(&mut train)?;
        println!(
            "session {}: +{} classes, {} examples ({} exemplars), {} steps, loss {:.4}",
            i,
            report.new_classes,
            report.fused_len,
            report.exemplars_fused,
            report.steps,
            report.final_loss
        );
        println!(
            "  memory: {} exemplars over {} classes",
            net.exemplars().total_exemplars(),
            net.exemplars().num_classes()
        );
    }

    // 3. Evaluate old and new classes separately
    let old_test = blobs(&old_classes, 20, &mut rng, &device)?.with_transform(normalize.clone());
    let new_test = blobs(&new_classes, 20, &mut rng, &device)?.with_transform(normalize);

    println!("\n--- NCM accuracy ---");
    println!("old classes (0-4): {:.3}", net.accuracy(&old_test)?);
    println!("new classes (5-9): {:.3}", net.accuracy(&new_test)?);
    println!("class-mean recomputations: {}", net.class_means().recomputations());

    Ok(())
}
