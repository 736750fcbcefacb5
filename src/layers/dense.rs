//! Dense (fully connected) layer implementation
//!
//! This module provides a DenseLayer that performs the transformation
//! `output = activation(input × weights + biases)`.

use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::kernels::{add_bias_rows, matmul, matmul_at_acc, matmul_bt, sum_rows_acc};
use crate::utils::{Activation, SeededRng};

/// Dense (fully connected) layer with weights, biases and a fused activation.
///
/// Performs `y = f(xW + b)` where x is the input (batch_size × input_size),
/// W is the weight matrix (input_size × output_size, row-major) and b the bias
/// vector (output_size).
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{DenseLayer, Layer};
/// use rust_dbn::utils::{Activation, SeededRng};
///
/// let mut rng = SeededRng::new(42);
/// let layer = DenseLayer::new(784, 512, Activation::Sigmoid, &mut rng);
/// assert_eq!(layer.input_size(), 784);
/// assert_eq!(layer.output_size(), 512);
/// ```
pub struct DenseLayer {
    input_size: usize,
    output_size: usize,
    activation: Activation,
    weights: Param,
    biases: Param,
    output_cache: Vec<f32>,
}

impl DenseLayer {
    /// Create a new DenseLayer with Xavier initialization.
    ///
    /// Weights are sampled uniformly from `[-limit, limit]` with
    /// `limit = sqrt(6 / (input_size + output_size))`; biases start at zero.
    pub fn new(
        input_size: usize,
        output_size: usize,
        activation: Activation,
        rng: &mut SeededRng,
    ) -> Self {
        let mut weights = vec![0.0f32; input_size * output_size];
        let limit = (6.0f32 / (input_size + output_size).max(1) as f32).sqrt();

        for value in &mut weights {
            *value = rng.gen_range_f32(-limit, limit);
        }

        Self {
            input_size,
            output_size,
            activation,
            weights: Param::weights("weights", weights),
            biases: Param::bias("biases", vec![0.0f32; output_size]),
            output_cache: Vec::new(),
        }
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights.value
    }

    pub fn biases(&self) -> &[f32] {
        &self.biases.value
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights.value
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases.value
    }
}

impl Layer for DenseLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Dense
    }

    fn input_shape(&self) -> Shape {
        Shape::flat(self.input_size)
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.output_size)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.input_size);
        check_len("output", output, batch_size * self.output_size);

        matmul(input, &self.weights.value, output, batch_size, self.input_size, self.output_size);
        add_bias_rows(output, &self.biases.value);
        self.activation.apply(output, self.output_size);

        self.output_cache.clear();
        self.output_cache.extend_from_slice(output);
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.output_size);
        check_len("grad_input", grad_input, batch_size * self.input_size);
        check_len("cached output", &self.output_cache, batch_size * self.output_size);

        let mut delta = vec![0.0f32; grad_output.len()];
        self.activation
            .backward(&self.output_cache, grad_output, &mut delta, self.output_size);
        self.backward_preactivation(input, &delta, grad_input, batch_size);
    }

    fn output_activation(&self) -> Option<Activation> {
        Some(self.activation)
    }

    fn backward_preactivation(
        &mut self,
        input: &[f32],
        delta: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("delta", delta, batch_size * self.output_size);
        check_len("grad_input", grad_input, batch_size * self.input_size);

        matmul_at_acc(
            input,
            delta,
            &mut self.weights.grad,
            batch_size,
            self.input_size,
            self.output_size,
            1.0,
        );
        sum_rows_acc(delta, &mut self.biases.grad, self.output_size, 1.0);
        matmul_bt(
            delta,
            &self.weights.value,
            grad_input,
            batch_size,
            self.output_size,
            self.input_size,
        );
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weights, &self.biases]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }
}
