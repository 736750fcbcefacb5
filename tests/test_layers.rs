//! Tests for the public layer API
//!
//! This file tests the layer catalogue through the `Layer` trait:
//! - DenseLayer: parameters and known forward values
//! - DropoutLayer / BatchNormLayer: training vs inference behaviour
//! - Transform layers: binarize, scale, rectify, reshape, LCN
//! - Sequence layers: embedding, RNN/LSTM shapes, last step
//! - A sequence classifier trained end to end

use approx::assert_relative_eq;
use rust_dbn::config::TrainingConfig;
use rust_dbn::dataset::{Dataset, Labels};
use rust_dbn::layers::{
    BatchNormLayer, BinarizeLayer, DenseLayer, DropoutLayer, EmbeddingLayer, LastStepLayer, Layer,
    LayerKind, LcnLayer, LstmLayer, RectifyLayer, ReshapeLayer, RnnLayer, ScaleLayer,
};
use rust_dbn::utils::{Activation, SeededRng};
use rust_dbn::{Network, Shape};

fn run(layer: &mut dyn Layer, input: &[f32], batch: usize) -> Vec<f32> {
    let mut output = vec![0.0f32; batch * layer.output_size()];
    layer.forward(input, &mut output, batch);
    output
}

// ============================================================================
// DenseLayer Tests
// ============================================================================

mod dense_layer_tests {
    use super::*;

    #[test]
    fn test_dense_parameter_count() {
        let mut rng = SeededRng::new(42);
        let layer = DenseLayer::new(10, 5, Activation::Identity, &mut rng);
        assert_eq!(layer.parameter_count(), 10 * 5 + 5);
        assert_eq!(layer.kind(), LayerKind::Dense);
        assert!(layer.is_trainable());
    }

    #[test]
    fn test_dense_xavier_bounds() {
        let mut rng = SeededRng::new(42);
        let layer = DenseLayer::new(100, 50, Activation::Identity, &mut rng);
        let limit = (6.0f32 / 150.0).sqrt();
        assert!(layer.weights().iter().all(|w| w.abs() <= limit));
        assert!(layer.biases().iter().all(|&b| b == 0.0));
    }

    #[test]
    fn test_dense_forward_known_values() {
        let mut rng = SeededRng::new(1);
        let mut layer = DenseLayer::new(2, 2, Activation::Identity, &mut rng);
        layer.weights_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        layer.biases_mut().copy_from_slice(&[0.5, -0.5]);

        let output = run(&mut layer, &[1.0, 1.0, 2.0, 0.0], 2);
        assert_eq!(output, vec![4.5, 5.5, 2.5, 3.5]);
    }

    #[test]
    fn test_dense_gradients_accumulate_until_cleared() {
        let mut rng = SeededRng::new(2);
        let mut layer = DenseLayer::new(2, 1, Activation::Identity, &mut rng);
        let input = [1.0, 2.0];
        let mut grad_input = [0.0; 2];
        run(&mut layer, &input, 1);
        layer.backward(&input, &[1.0], &mut grad_input, 1);
        layer.backward(&input, &[1.0], &mut grad_input, 1);
        assert_eq!(layer.params()[0].grad, vec![2.0, 4.0]);

        layer.params_mut().into_iter().for_each(|p| p.zero_grad());
        assert!(layer.params()[0].grad.iter().all(|&g| g == 0.0));
    }
}

// ============================================================================
// Mode-dependent Layer Tests
// ============================================================================

mod mode_tests {
    use super::*;

    #[test]
    fn test_dropout_identity_in_inference() {
        let mut rng = SeededRng::new(3);
        let mut layer = DropoutLayer::new(Shape::flat(100), 0.5, &mut rng).unwrap();
        let input: Vec<f32> = (0..100).map(|i| i as f32).collect();
        assert_eq!(run(&mut layer, &input, 1), input);
    }

    #[test]
    fn test_dropout_scales_kept_units_in_training() {
        let mut rng = SeededRng::new(4);
        let mut layer = DropoutLayer::new(Shape::flat(1000), 0.25, &mut rng).unwrap();
        layer.set_training(true);
        let output = run(&mut layer, &vec![1.0; 1000], 1);

        let kept = output.iter().filter(|&&v| v != 0.0).count();
        assert!(output.iter().all(|&v| v == 0.0 || (v - 1.0 / 0.75).abs() < 1e-6));
        assert!((kept as f32 / 1000.0 - 0.75).abs() < 0.06);
    }

    #[test]
    fn test_dropout_rate_validated() {
        let mut rng = SeededRng::new(5);
        assert!(DropoutLayer::new(Shape::flat(4), 1.0, &mut rng).is_err());
        assert!(DropoutLayer::new(Shape::flat(4), -0.1, &mut rng).is_err());
    }

    #[test]
    fn test_batchnorm_training_normalizes_batch() {
        let mut layer = BatchNormLayer::new(Shape::flat(2), 1e-5, 0.9).unwrap();
        layer.set_training(true);
        let output = run(&mut layer, &[1.0, 10.0, 3.0, 20.0, 5.0, 30.0], 3);

        for f in 0..2 {
            let column: Vec<f32> = output.iter().skip(f).step_by(2).copied().collect();
            let mean = column.iter().sum::<f32>() / 3.0;
            let var = column.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 3.0;
            assert_relative_eq!(mean, 0.0, epsilon = 1e-5);
            assert_relative_eq!(var, 1.0, epsilon = 1e-3);
        }
    }

    #[test]
    fn test_batchnorm_running_stats_only_move_in_training() {
        let mut layer = BatchNormLayer::new(Shape::flat(1), 1e-5, 0.9).unwrap();
        run(&mut layer, &[4.0, 6.0], 2);
        assert_eq!(layer.running_mean(), &[0.0]);

        layer.set_training(true);
        run(&mut layer, &[4.0, 6.0], 2);
        assert_relative_eq!(layer.running_mean()[0], 0.1 * 5.0, epsilon = 1e-6);
    }
}

// ============================================================================
// Transform Layer Tests
// ============================================================================

mod transform_tests {
    use super::*;

    #[test]
    fn test_binarize_threshold() {
        let mut layer = BinarizeLayer::new(Shape::flat(4), 0.5);
        assert_eq!(run(&mut layer, &[0.2, 0.5, 0.51, 1.0], 1), vec![0.0, 0.0, 1.0, 1.0]);
        assert!(!layer.is_differentiable());
    }

    #[test]
    fn test_scale_and_gradient() {
        let mut layer = ScaleLayer::new(Shape::flat(2), 1.0 / 255.0);
        let output = run(&mut layer, &[255.0, 51.0], 1);
        assert_relative_eq!(output[0], 1.0, epsilon = 1e-6);
        assert_relative_eq!(output[1], 0.2, epsilon = 1e-6);

        let mut grad = [0.0; 2];
        layer.backward(&[255.0, 51.0], &[255.0, 255.0], &mut grad, 1);
        assert_relative_eq!(grad[0], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_rectify_absolute_value() {
        let mut layer = RectifyLayer::new(Shape::flat(3));
        assert_eq!(run(&mut layer, &[-2.0, 0.0, 3.0], 1), vec![2.0, 0.0, 3.0]);
    }

    #[test]
    fn test_reshape_keeps_values() {
        let mut layer = ReshapeLayer::new(Shape::flat(8), Shape::image(2, 2, 2)).unwrap();
        let input: Vec<f32> = (0..8).map(|i| i as f32).collect();
        assert_eq!(run(&mut layer, &input, 1), input);
        assert!(ReshapeLayer::new(Shape::flat(8), Shape::flat(9)).is_err());
    }

    #[test]
    fn test_lcn_flattens_constant_map() {
        let mut layer = LcnLayer::new(1, 5, 5, 3, 1.0).unwrap();
        let output = run(&mut layer, &[3.0; 25], 1);
        // Interior of a constant map is fully explained by its local mean
        assert_relative_eq!(output[12], 0.0, epsilon = 1e-5);
        assert!(LcnLayer::new(1, 5, 5, 4, 1.0).is_err());
    }
}

// ============================================================================
// Sequence Layer Tests
// ============================================================================

mod sequence_tests {
    use super::*;

    #[test]
    fn test_sequence_shapes() {
        let mut rng = SeededRng::new(6);
        let embedding = EmbeddingLayer::new(5, 20, 8, &mut rng).unwrap();
        let rnn = RnnLayer::new(5, 8, 6, &mut rng).unwrap();
        let lstm = LstmLayer::new(5, 6, 4, &mut rng).unwrap();
        let last = LastStepLayer::new(5, 4).unwrap();

        assert_eq!(embedding.output_shape(), Shape::sequence(5, 8));
        assert_eq!(rnn.output_shape(), Shape::sequence(5, 6));
        assert_eq!(lstm.output_shape(), Shape::sequence(5, 4));
        assert_eq!(last.output_shape(), Shape::flat(4));
    }

    #[test]
    fn test_embedding_lookup() {
        let mut rng = SeededRng::new(7);
        let mut layer = EmbeddingLayer::new(2, 3, 2, &mut rng).unwrap();
        layer.params_mut()[0].value.copy_from_slice(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        assert_eq!(run(&mut layer, &[2.0, 0.0], 1), vec![4.0, 5.0, 0.0, 1.0]);
    }

    #[test]
    fn test_last_step_selects_final_row() {
        let mut layer = LastStepLayer::new(3, 2).unwrap();
        let output = run(&mut layer, &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], 1);
        assert_eq!(output, vec![5.0, 6.0]);
    }

    #[test]
    fn test_sequence_classifier_learns() {
        let mut rng = SeededRng::new(8);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(EmbeddingLayer::new(3, 4, 4, &mut rng).unwrap()),
            Box::new(LstmLayer::new(3, 4, 6, &mut rng).unwrap()),
            Box::new(LastStepLayer::new(3, 6).unwrap()),
            Box::new(DenseLayer::new(6, 2, Activation::Softmax, &mut rng)),
        ];
        let config = TrainingConfig {
            learning_rate: 0.2,
            momentum: 0.5,
            batch_size: 4,
            ..TrainingConfig::default()
        };
        let mut net = Network::new(layers, config).unwrap();

        // The class is the parity of the last token
        let mut tokens = Vec::new();
        let mut labels = Vec::new();
        for i in 0..16usize {
            let sequence = [i % 4, (i / 4) % 4, (i * 3) % 4];
            tokens.extend(sequence.iter().map(|&t| t as f32));
            labels.push(sequence[2] % 2);
        }
        let data = Dataset::new(Shape::flat(3), tokens).unwrap();
        let labels = Labels::classes(2, labels);

        let history = net.fine_tune(&data, &labels, 40).unwrap();
        assert!(history[39].loss < history[0].loss);
    }
}
