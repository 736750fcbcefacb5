//! Standalone activation layer.

use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind};
use crate::shape::Shape;
use crate::utils::Activation;

/// Applies a fixed nonlinearity to every value of a sample.
///
/// Softmax normalises over the whole sample.
pub struct ActivationLayer {
    shape: Shape,
    activation: Activation,
    output_cache: Vec<f32>,
}

impl ActivationLayer {
    pub fn new(shape: Shape, activation: Activation) -> Self {
        Self {
            shape,
            activation,
            output_cache: Vec::new(),
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Layer for ActivationLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Activation
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let len = self.shape.len();
        check_len("input", input, batch_size * len);
        check_len("output", output, batch_size * len);

        output.copy_from_slice(input);
        self.activation.apply(output, len);
        self.output_cache.clear();
        self.output_cache.extend_from_slice(output);
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let len = self.shape.len();
        check_len("grad_output", grad_output, batch_size * len);
        check_len("grad_input", grad_input, batch_size * len);
        self.activation
            .backward(&self.output_cache, grad_output, grad_input, len);
    }

    fn output_activation(&self) -> Option<Activation> {
        Some(self.activation)
    }

    fn backward_preactivation(
        &mut self,
        _input: &[f32],
        grad_preactivation: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let len = self.shape.len();
        check_len("grad_preactivation", grad_preactivation, batch_size * len);
        check_len("grad_input", grad_input, batch_size * len);
        grad_input.copy_from_slice(grad_preactivation);
    }
}
