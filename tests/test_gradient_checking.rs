//! Finite-difference gradient checks for every differentiable layer.
//!
//! Each check uses the scalar loss `L = Σ r·y` with a fixed random `r`, so the
//! gradient handed to `backward` is `r` itself. Analytical gradients w.r.t. the
//! input and every parameter are compared against centered differences.
//! Everything runs in f32, hence the loose step and tolerance.

use rust_dbn::layers::{
    AvgPool2DLayer, BatchNormLayer, Conv2DLayer, ConvConfig, ConvRbmConfig, ConvRbmLayer,
    Deconv2DLayer, DenseLayer, GroupLayer, Layer, LstmLayer, MaxPool2DLayer, MergeLayer, Padding,
    PoolConfig, RbmConfig, RbmLayer, RnnLayer, ScaleLayer, HiddenUnit, VisibleUnit,
};
use rust_dbn::utils::{Activation, SeededRng};
use rust_dbn::Shape;

const STEP: f32 = 1e-2;
const MAX_CHECKS: usize = 24;

fn close(analytic: f32, numeric: f32) -> bool {
    (analytic - numeric).abs() <= 1e-2 * analytic.abs().max(numeric.abs()) + 1e-3
}

fn weighted_output(layer: &mut dyn Layer, input: &[f32], weights: &[f32], batch: usize) -> f32 {
    let mut output = vec![0.0f32; batch * layer.output_size()];
    layer.forward(input, &mut output, batch);
    output.iter().zip(weights).map(|(y, r)| y * r).sum()
}

/// Indices to check, spread over the whole tensor.
fn check_indices(len: usize) -> Vec<usize> {
    if len <= MAX_CHECKS {
        (0..len).collect()
    } else {
        (0..MAX_CHECKS).map(|i| i * len / MAX_CHECKS).collect()
    }
}

fn check_layer(name: &str, layer: &mut dyn Layer, input: Vec<f32>, batch: usize, seed: u64) {
    let mut rng = SeededRng::new(seed);
    let weights: Vec<f32> = (0..batch * layer.output_size())
        .map(|_| rng.gen_range_f32(-1.0, 1.0))
        .collect();

    let mut output = vec![0.0f32; batch * layer.output_size()];
    let mut grad_input = vec![0.0f32; input.len()];
    layer.params_mut().into_iter().for_each(|p| p.zero_grad());
    layer.forward(&input, &mut output, batch);
    layer.backward(&input, &weights, &mut grad_input, batch);
    let param_grads: Vec<Vec<f32>> = layer.params().iter().map(|p| p.grad.clone()).collect();

    if layer.is_differentiable() {
        let mut shifted = input.clone();
        for i in check_indices(input.len()) {
            shifted[i] = input[i] + STEP;
            let plus = weighted_output(layer, &shifted, &weights, batch);
            shifted[i] = input[i] - STEP;
            let minus = weighted_output(layer, &shifted, &weights, batch);
            shifted[i] = input[i];

            let numeric = (plus - minus) / (2.0 * STEP);
            assert!(
                close(grad_input[i], numeric),
                "{}: input gradient {} mismatch: analytic {}, numeric {}",
                name,
                i,
                grad_input[i],
                numeric
            );
        }
    }

    for (p, grads) in param_grads.iter().enumerate() {
        for i in check_indices(grads.len()) {
            let original = layer.params()[p].value[i];
            layer.params_mut()[p].value[i] = original + STEP;
            let plus = weighted_output(layer, &input, &weights, batch);
            layer.params_mut()[p].value[i] = original - STEP;
            let minus = weighted_output(layer, &input, &weights, batch);
            layer.params_mut()[p].value[i] = original;

            let numeric = (plus - minus) / (2.0 * STEP);
            let param_name = layer.params()[p].name();
            assert!(
                close(grads[i], numeric),
                "{}: gradient of {}[{}] mismatch: analytic {}, numeric {}",
                name,
                param_name,
                i,
                grads[i],
                numeric
            );
        }
    }
}

fn random_input(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SeededRng::new(seed);
    (0..len).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect()
}

/// Distinct values at least 0.05 apart, so a shifted step never changes a max.
fn spaced_input(len: usize, seed: u64) -> Vec<f32> {
    let mut rng = SeededRng::new(seed);
    let mut order: Vec<usize> = (0..len).collect();
    rng.shuffle_usize(&mut order);
    order.iter().map(|&i| i as f32 * 0.05 - 1.0).collect()
}

// ============================================================================
// Feed-forward layers
// ============================================================================

mod feed_forward_tests {
    use super::*;

    #[test]
    fn test_dense_sigmoid_gradients() {
        let mut rng = SeededRng::new(1);
        let mut layer = DenseLayer::new(5, 4, Activation::Sigmoid, &mut rng);
        check_layer("dense", &mut layer, random_input(3 * 5, 2), 3, 3);
    }

    #[test]
    fn test_dense_softmax_gradients() {
        let mut rng = SeededRng::new(4);
        let mut layer = DenseLayer::new(4, 3, Activation::Softmax, &mut rng);
        check_layer("dense softmax", &mut layer, random_input(2 * 4, 5), 2, 6);
    }

    #[test]
    fn test_conv_valid_gradients() {
        let mut rng = SeededRng::new(7);
        let config = ConvConfig::new(2, 3, 3, 5, 5).with_activation(Activation::Tanh);
        let mut layer = Conv2DLayer::new(config, &mut rng).unwrap();
        check_layer("conv valid", &mut layer, random_input(2 * 2 * 25, 8), 2, 9);
    }

    #[test]
    fn test_conv_same_strided_gradients() {
        let mut rng = SeededRng::new(10);
        let config = ConvConfig::new(1, 2, 3, 6, 6)
            .with_padding(Padding::Same)
            .with_stride(2)
            .with_activation(Activation::Sigmoid);
        let mut layer = Conv2DLayer::new(config, &mut rng).unwrap();
        check_layer("conv same", &mut layer, random_input(36, 11), 1, 12);
    }

    #[test]
    fn test_deconv_gradients() {
        let mut rng = SeededRng::new(13);
        let config = ConvConfig::new(2, 1, 3, 3, 3);
        let mut layer = Deconv2DLayer::new(config, &mut rng).unwrap();
        check_layer("deconv", &mut layer, random_input(2 * 18, 14), 2, 15);
    }

    #[test]
    fn test_batchnorm_training_gradients() {
        let mut layer = BatchNormLayer::new(Shape::flat(3), 1e-5, 0.9).unwrap();
        layer.set_training(true);
        check_layer("batchnorm", &mut layer, random_input(4 * 3, 16), 4, 17);
    }

    #[test]
    fn test_batchnorm_channel_gradients() {
        let mut layer = BatchNormLayer::new(Shape::image(2, 2, 2), 1e-5, 0.9).unwrap();
        layer.set_training(true);
        check_layer("batchnorm channels", &mut layer, random_input(3 * 8, 18), 3, 19);
    }
}

// ============================================================================
// Pooling layers
// ============================================================================

mod pooling_tests {
    use super::*;

    #[test]
    fn test_max_pool_gradients() {
        let mut layer = MaxPool2DLayer::new(PoolConfig::square(2, 4, 4, 2)).unwrap();
        check_layer("max pool", &mut layer, spaced_input(2 * 2 * 16, 20), 2, 21);
    }

    #[test]
    fn test_overlapping_max_pool_gradients() {
        let mut layer = MaxPool2DLayer::new(PoolConfig::square(1, 5, 5, 3).with_stride(1)).unwrap();
        check_layer("overlapping max pool", &mut layer, spaced_input(25, 22), 1, 23);
    }

    #[test]
    fn test_avg_pool_gradients() {
        let mut layer = AvgPool2DLayer::new(PoolConfig::square(1, 4, 4, 2)).unwrap();
        check_layer("avg pool", &mut layer, random_input(2 * 16, 24), 2, 25);
    }
}

// ============================================================================
// Recurrent layers
// ============================================================================

mod recurrent_tests {
    use super::*;

    #[test]
    fn test_rnn_gradients() {
        let mut rng = SeededRng::new(26);
        let mut layer = RnnLayer::new(4, 3, 2, &mut rng).unwrap();
        check_layer("rnn", &mut layer, random_input(2 * 4 * 3, 27), 2, 28);
    }

    #[test]
    fn test_lstm_gradients() {
        let mut rng = SeededRng::new(29);
        let mut layer = LstmLayer::new(3, 2, 3, &mut rng).unwrap();
        check_layer("lstm", &mut layer, random_input(2 * 3 * 2, 30), 2, 31);
    }
}

// ============================================================================
// RBM layers (mean-field forward)
// ============================================================================

mod rbm_tests {
    use super::*;

    #[test]
    fn test_dense_rbm_gradients() {
        let mut rng = SeededRng::new(32);
        let mut layer = RbmLayer::new(RbmConfig::new(5, 4), &mut rng).unwrap();
        check_layer("rbm", &mut layer, random_input(2 * 5, 33), 2, 34);
    }

    #[test]
    fn test_gaussian_relu_rbm_gradients() {
        let mut rng = SeededRng::new(35);
        let config = RbmConfig::new(4, 3).with_units(VisibleUnit::Gaussian, HiddenUnit::Relu);
        let mut layer = RbmLayer::new(config, &mut rng).unwrap();
        // Keep pre-activations away from the rectifier's kink
        layer.params_mut()[1].value.iter_mut().for_each(|b| *b = 0.5);
        check_layer("gaussian relu rbm", &mut layer, random_input(2 * 4, 36), 2, 37);
    }

    #[test]
    fn test_pooled_rbm_gradients() {
        let mut rng = SeededRng::new(38);
        let mut layer = RbmLayer::new(RbmConfig::new(4, 6).with_pooling(2), &mut rng).unwrap();
        layer.weights_mut().iter_mut().for_each(|w| *w *= 50.0);
        check_layer("pooled rbm", &mut layer, random_input(2 * 4, 39), 2, 40);
    }

    #[test]
    fn test_conv_rbm_gradients() {
        let mut rng = SeededRng::new(41);
        let mut layer = ConvRbmLayer::new(ConvRbmConfig::new(1, 5, 5, 2, 2), &mut rng).unwrap();
        layer.weights_mut().iter_mut().for_each(|w| *w *= 50.0);
        check_layer("conv rbm", &mut layer, random_input(25, 42), 1, 43);
    }

    #[test]
    fn test_pooled_conv_rbm_gradients() {
        let mut rng = SeededRng::new(44);
        let config = ConvRbmConfig::new(1, 5, 5, 2, 2).with_pooling(2);
        let mut layer = ConvRbmLayer::new(config, &mut rng).unwrap();
        layer.weights_mut().iter_mut().for_each(|w| *w *= 50.0);
        check_layer("pooled conv rbm", &mut layer, random_input(25, 45), 1, 46);
    }
}

// ============================================================================
// Composite layers
// ============================================================================

mod composite_tests {
    use super::*;

    #[test]
    fn test_group_gradients() {
        let mut rng = SeededRng::new(47);
        let mut layer = GroupLayer::new(vec![
            Box::new(DenseLayer::new(4, 3, Activation::Tanh, &mut rng)),
            Box::new(ScaleLayer::new(Shape::flat(3), 2.0)),
            Box::new(DenseLayer::new(3, 2, Activation::Sigmoid, &mut rng)),
        ])
        .unwrap();
        check_layer("group", &mut layer, random_input(2 * 4, 48), 2, 49);
    }

    #[test]
    fn test_merge_gradients() {
        let mut rng = SeededRng::new(50);
        let mut layer = MergeLayer::new(vec![
            Box::new(DenseLayer::new(3, 2, Activation::Sigmoid, &mut rng)),
            Box::new(DenseLayer::new(3, 4, Activation::Tanh, &mut rng)),
        ])
        .unwrap();
        check_layer("merge", &mut layer, random_input(2 * 3, 51), 2, 52);
    }
}
