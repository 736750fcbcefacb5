//! Contrastive Divergence training of RBM layers
//!
//! This file tests:
//! - CD-1 convergence on a tiny 2-visible/2-hidden RBM over repeated seeds
//! - Persistent CD, sparsity and visible-bias initialisation
//! - Pooled and convolutional RBMs inside a pretrained stack
//! - Unit combinations rejected at construction

use approx::assert_relative_eq;
use rust_dbn::config::{SparsityConfig, TrainingConfig};
use rust_dbn::dataset::{Dataset, InMemoryBatches};
use rust_dbn::layers::{
    ConvRbmConfig, ConvRbmLayer, HiddenUnit, Layer, MaxPool2DLayer, PoolConfig, RbmConfig, RbmLayer,
    VisibleUnit,
};
use rust_dbn::trainers::CdTrainer;
use rust_dbn::utils::SeededRng;
use rust_dbn::{DbnError, Network, Shape};

fn cd_config(seed: u64) -> TrainingConfig {
    let mut config = TrainingConfig {
        learning_rate: 1.0,
        momentum: 0.5,
        batch_size: 4,
        seed,
        ..TrainingConfig::default()
    };
    config.cd.k = 1;
    config
}

/// Half the samples are `[1, 0]`, half `[0, 1]`.
fn two_patterns() -> Dataset {
    let mut samples = Vec::new();
    for i in 0..16 {
        if i % 2 == 0 {
            samples.extend_from_slice(&[1.0, 0.0]);
        } else {
            samples.extend_from_slice(&[0.0, 1.0]);
        }
    }
    Dataset::new(Shape::flat(2), samples).unwrap()
}

fn mean(values: impl Iterator<Item = f32>) -> f32 {
    let values: Vec<f32> = values.collect();
    values.iter().sum::<f32>() / values.len() as f32
}

// ============================================================================
// Convergence Tests
// ============================================================================

mod convergence_tests {
    use super::*;

    #[test]
    fn test_cd1_reduces_reconstruction_error_over_seeds() {
        let data = two_patterns();
        let mut early = Vec::new();
        let mut late = Vec::new();

        for seed in 1..=5u64 {
            let mut rng = SeededRng::new(seed);
            let layers: Vec<Box<dyn Layer>> =
                vec![Box::new(RbmLayer::new(RbmConfig::new(2, 2), &mut rng).unwrap())];
            let mut net = Network::new(layers, cd_config(seed)).unwrap();
            let history = net.pretrain(&data, 50).unwrap().remove(0);
            assert_eq!(history.len(), 50);

            early.push(mean(history[..10].iter().map(|s| s.reconstruction_error)));
            late.push(mean(history[40..].iter().map(|s| s.reconstruction_error)));
        }

        let early = mean(early.into_iter());
        let late = mean(late.into_iter());
        assert!(late < early, "mean reconstruction error went from {} to {}", early, late);
    }

    #[test]
    fn test_persistent_cd_reduces_reconstruction_error() {
        let data = two_patterns();
        let mut rng = SeededRng::new(3);
        let layers: Vec<Box<dyn Layer>> =
            vec![Box::new(RbmLayer::new(RbmConfig::new(2, 4), &mut rng).unwrap())];
        let mut config = cd_config(3);
        config.cd.persistent = true;
        config.cd.chains = Some(6);
        let mut net = Network::new(layers, config).unwrap();

        let before = net.reconstruction_error(&data).unwrap();
        net.pretrain(&data, 50).unwrap();
        let after = net.reconstruction_error(&data).unwrap();
        assert!(after < before, "reconstruction error {} -> {}", before, after);
    }

    #[test]
    fn test_cd_k_runs_more_gibbs_steps_deterministically() {
        let data = two_patterns();
        let run = || {
            let mut rng = SeededRng::new(8);
            let layers: Vec<Box<dyn Layer>> =
                vec![Box::new(RbmLayer::new(RbmConfig::new(2, 2), &mut rng).unwrap())];
            let mut config = cd_config(8);
            config.cd.k = 3;
            let mut net = Network::new(layers, config).unwrap();
            net.pretrain(&data, 5).unwrap();
            net.layers()[0].params()[0].value.clone()
        };
        assert_eq!(run(), run());
    }
}

// ============================================================================
// Regularisation and initialisation Tests
// ============================================================================

mod regularisation_tests {
    use super::*;

    #[test]
    fn test_sparsity_pulls_activity_toward_target() {
        let data = two_patterns();
        let mut rng = SeededRng::new(4);
        let layers: Vec<Box<dyn Layer>> =
            vec![Box::new(RbmLayer::new(RbmConfig::new(2, 4), &mut rng).unwrap())];
        let mut config = cd_config(4);
        config.learning_rate = 0.1;
        config.sparsity = Some(SparsityConfig {
            target: 0.05,
            cost: 1.0,
            decay: 0.5,
        });
        let mut net = Network::new(layers, config).unwrap();

        let history = net.pretrain(&data, 40).unwrap().remove(0);
        let first = history[0].hidden_activity;
        let last = history[39].hidden_activity;
        assert!(last < first, "hidden activity went from {} to {}", first, last);
        assert!(last < 0.3);
    }

    #[test]
    fn test_visible_biases_initialised_from_log_odds() {
        let samples = vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0];
        let data = Dataset::new(Shape::flat(2), samples).unwrap();
        let mut rng = SeededRng::new(5);
        let mut layer = RbmLayer::new(RbmConfig::new(2, 3), &mut rng).unwrap();

        let mut trainer = CdTrainer::new(&cd_config(5));
        let mut batches = InMemoryBatches::unlabeled(&data, 2, false);
        trainer
            .train(&mut layer, &mut batches, data.as_slice(), 0, &mut rng)
            .unwrap();

        // means: 0.75 and 0.25
        assert_relative_eq!(layer.visible_biases()[0], 3.0f32.ln(), epsilon = 1e-5);
        assert_relative_eq!(layer.visible_biases()[1], -(3.0f32.ln()), epsilon = 1e-5);
    }

    #[test]
    fn test_gaussian_visible_biases_initialised_from_means() {
        let samples = vec![2.0, -1.0, 4.0, -3.0];
        let data = Dataset::new(Shape::flat(2), samples).unwrap();
        let mut rng = SeededRng::new(6);
        let config = RbmConfig::new(2, 3).with_units(VisibleUnit::Gaussian, HiddenUnit::Binary);
        let mut layer = RbmLayer::new(config, &mut rng).unwrap();

        let mut trainer = CdTrainer::new(&cd_config(6));
        let mut batches = InMemoryBatches::unlabeled(&data, 2, false);
        trainer
            .train(&mut layer, &mut batches, data.as_slice(), 0, &mut rng)
            .unwrap();

        assert_relative_eq!(layer.visible_biases()[0], 3.0, epsilon = 1e-6);
        assert_relative_eq!(layer.visible_biases()[1], -2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_cd_rejects_wrong_visible_size() {
        let data = two_patterns();
        let mut rng = SeededRng::new(7);
        let mut layer = RbmLayer::new(RbmConfig::new(3, 2), &mut rng).unwrap();
        let mut trainer = CdTrainer::new(&cd_config(7));
        let mut batches = InMemoryBatches::unlabeled(&data, 4, true);
        assert!(matches!(
            trainer.train(&mut layer, &mut batches, data.as_slice(), 1, &mut rng),
            Err(DbnError::DataShape { expected: 3, actual: 2 })
        ));
    }
}

// ============================================================================
// Pooled and convolutional RBM Tests
// ============================================================================

mod structured_rbm_tests {
    use super::*;

    fn stripes() -> Dataset {
        let mut samples = Vec::new();
        for i in 0..12 {
            for y in 0..6 {
                for x in 0..6 {
                    let on = if i % 2 == 0 { x % 2 == 0 } else { y % 2 == 0 };
                    samples.push(if on { 1.0 } else { 0.0 });
                }
            }
        }
        Dataset::new(Shape::image(1, 6, 6), samples).unwrap()
    }

    #[test]
    fn test_pooled_rbm_trains() {
        let data = two_patterns();
        let mut rng = SeededRng::new(9);
        let config = RbmConfig::new(2, 4).with_pooling(2);
        let layers: Vec<Box<dyn Layer>> = vec![Box::new(RbmLayer::new(config, &mut rng).unwrap())];
        let mut net = Network::new(layers, cd_config(9)).unwrap();
        assert_eq!(net.output_shape(), Shape::flat(2));

        let history = net.pretrain(&data, 10).unwrap().remove(0);
        assert!(history.iter().all(|s| s.reconstruction_error.is_finite()));
        let output = net.infer(&[1.0, 0.0]).unwrap();
        assert!(output.iter().all(|&p| (0.0..=1.0).contains(&p)));
    }

    #[test]
    fn test_conv_rbm_stack_pretrains_through_pooling() {
        let data = stripes();
        let mut rng = SeededRng::new(10);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(ConvRbmLayer::new(ConvRbmConfig::new(1, 6, 6, 2, 3), &mut rng).unwrap()),
            Box::new(MaxPool2DLayer::new(PoolConfig::square(2, 4, 4, 2)).unwrap()),
            Box::new(RbmLayer::new(RbmConfig::new(8, 3), &mut rng).unwrap()),
        ];
        let mut config = cd_config(10);
        config.learning_rate = 0.1;
        let mut net = Network::new(layers, config).unwrap();

        let history = net.pretrain(&data, 5).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().flatten().all(|s| s.reconstruction_error.is_finite()));
    }

    #[test]
    fn test_pooled_conv_rbm_output_shape() {
        let mut rng = SeededRng::new(11);
        let config = ConvRbmConfig::new(1, 6, 6, 3, 3).with_pooling(2);
        let layer = ConvRbmLayer::new(config, &mut rng).unwrap();
        assert_eq!(layer.hidden_shape(), Shape::image(3, 4, 4));
        assert_eq!(layer.output_shape(), Shape::image(3, 2, 2));
    }
}

// ============================================================================
// Unit Combination Tests
// ============================================================================

mod unit_tests {
    use super::*;

    #[test]
    fn test_gaussian_gaussian_rejected() {
        let mut rng = SeededRng::new(12);
        let config = RbmConfig::new(4, 3).with_units(VisibleUnit::Gaussian, HiddenUnit::Gaussian);
        assert!(matches!(RbmLayer::new(config, &mut rng), Err(DbnError::UnsupportedUnits(_))));
    }

    #[test]
    fn test_pooling_requires_binary_hidden_units() {
        let mut rng = SeededRng::new(13);
        let config = RbmConfig::new(4, 4)
            .with_units(VisibleUnit::Binary, HiddenUnit::Relu)
            .with_pooling(2);
        assert!(matches!(RbmLayer::new(config, &mut rng), Err(DbnError::UnsupportedUnits(_))));
    }

    #[test]
    fn test_pooling_must_divide_hidden_units() {
        let mut rng = SeededRng::new(14);
        let config = RbmConfig::new(4, 5).with_pooling(2);
        assert!(matches!(RbmLayer::new(config, &mut rng), Err(DbnError::InvalidConfig(_))));
    }

    #[test]
    fn test_conv_pooling_must_divide_hidden_maps() {
        let mut rng = SeededRng::new(15);
        let config = ConvRbmConfig::new(1, 6, 6, 2, 2).with_pooling(2);
        assert!(ConvRbmLayer::new(config, &mut rng).is_err());
    }
}
