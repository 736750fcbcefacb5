//! Activation functions for layers
//!
//! This module provides the elementwise nonlinearities fused into dense and
//! convolutional layers (sigmoid, tanh, rectified linear, softmax) together with
//! their derivatives expressed in terms of the activation *output*, which is
//! what the layers cache for the backward pass.

use serde::{Deserialize, Serialize};

/// Logistic sigmoid: 1 / (1 + exp(-x)).
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Sigmoid derivative assuming y = sigmoid(x).
pub fn sigmoid_derivative(y: f32) -> f32 {
    y * (1.0 - y)
}

/// ReLU applied in-place.
pub fn relu_inplace(data: &mut [f32]) {
    for value in data.iter_mut() {
        if *value < 0.0 {
            *value = 0.0;
        }
    }
}

/// Softmax applied row-wise with max-subtraction for numerical stability.
///
/// # Arguments
/// * `outputs` - Flat array containing row-major matrix data
/// * `rows` - Number of rows in the matrix
/// * `cols` - Number of columns in the matrix
pub fn softmax_rows(outputs: &mut [f32], rows: usize, cols: usize) {
    if cols == 0 {
        return;
    }
    assert_eq!(outputs.len(), rows * cols, "outputs length mismatch in softmax_rows");

    for row in outputs.chunks_exact_mut(cols).take(rows) {
        let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut sum = 0.0f32;
        for value in row.iter_mut() {
            *value = (*value - max_value).exp();
            sum += *value;
        }

        let inv_sum = 1.0f32 / sum;
        for value in row.iter_mut() {
            *value *= inv_sum;
        }
    }
}

/// Nonlinearity fused at the end of a layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Identity,
    Sigmoid,
    Tanh,
    Relu,
    /// Softmax over each sample (the whole row of `cols` values).
    Softmax,
}

impl Activation {
    /// Apply the activation in place to `data`, viewed as rows of `cols` values.
    pub fn apply(&self, data: &mut [f32], cols: usize) {
        match self {
            Activation::Identity => {}
            Activation::Sigmoid => data.iter_mut().for_each(|v| *v = sigmoid(*v)),
            Activation::Tanh => data.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Relu => relu_inplace(data),
            Activation::Softmax => {
                let rows = if cols == 0 { 0 } else { data.len() / cols };
                softmax_rows(data, rows, cols);
            }
        }
    }

    /// Gradient w.r.t. the pre-activation, given the cached `output` and the
    /// gradient w.r.t. that output. Rows are `cols` values wide.
    pub fn backward(
        &self,
        output: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        cols: usize,
    ) {
        assert_eq!(output.len(), grad_output.len());
        assert_eq!(output.len(), grad_input.len());

        match self {
            Activation::Identity => grad_input.copy_from_slice(grad_output),
            Activation::Sigmoid => {
                for ((gi, &g), &y) in grad_input.iter_mut().zip(grad_output).zip(output) {
                    *gi = g * sigmoid_derivative(y);
                }
            }
            Activation::Tanh => {
                for ((gi, &g), &y) in grad_input.iter_mut().zip(grad_output).zip(output) {
                    *gi = g * (1.0 - y * y);
                }
            }
            Activation::Relu => {
                for ((gi, &g), &y) in grad_input.iter_mut().zip(grad_output).zip(output) {
                    *gi = if y > 0.0 { g } else { 0.0 };
                }
            }
            Activation::Softmax => {
                // Jacobian-vector product: dz_j = y_j * (g_j - sum_k g_k y_k)
                for ((gi, g), y) in grad_input
                    .chunks_exact_mut(cols)
                    .zip(grad_output.chunks_exact(cols))
                    .zip(output.chunks_exact(cols))
                {
                    let dot: f32 = g.iter().zip(y).map(|(a, b)| a * b).sum();
                    for j in 0..cols {
                        gi[j] = y[j] * (g[j] - dot);
                    }
                }
            }
        }
    }
}
