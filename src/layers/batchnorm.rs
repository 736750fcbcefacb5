//! Batch Normalization layer implementation
//!
//! This module provides a BatchNormLayer that normalizes inputs across the
//! mini-batch, then applies learnable scale (gamma) and shift (beta) parameters:
//!
//! ```text
//! y = gamma * (x - mean) / sqrt(var + epsilon) + beta
//! ```
//!
//! Flat inputs `[n]` are normalized per feature; image inputs `[c, h, w]` per
//! channel, pooling the statistics over the batch and all spatial positions.
//!
//! During training, batch normalization uses batch statistics and updates running
//! statistics with an exponential moving average. During inference it uses the
//! accumulated running statistics instead.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;

/// Batch Normalization layer.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{BatchNormLayer, Layer};
/// use rust_dbn::Shape;
///
/// let layer = BatchNormLayer::new(Shape::image(16, 8, 8), 1e-5, 0.9).unwrap();
/// assert_eq!(layer.channels(), 16);
/// assert_eq!(layer.parameter_count(), 32); // 16 gamma + 16 beta
/// ```
pub struct BatchNormLayer {
    shape: Shape,
    channels: usize,
    spatial: usize,
    epsilon: f32,
    momentum: f32,
    training: bool,

    gamma: Param,
    beta: Param,

    running_mean: Vec<f32>,
    running_var: Vec<f32>,

    // Cached for backward
    normalized: Vec<f32>,
    inv_std: Vec<f32>,
}

impl BatchNormLayer {
    /// Create a new layer with gamma 1.0, beta 0.0, running mean 0.0 and
    /// running variance 1.0.
    ///
    /// `momentum` weights the old running value:
    /// `running = momentum * running + (1 - momentum) * batch`.
    pub fn new(shape: Shape, epsilon: f32, momentum: f32) -> Result<Self> {
        if epsilon <= 0.0 {
            return Err(DbnError::InvalidConfig("epsilon must be positive".into()));
        }
        if !(0.0..=1.0).contains(&momentum) {
            return Err(DbnError::InvalidConfig(
                "momentum must be in range [0.0, 1.0]".into(),
            ));
        }
        let (channels, spatial) = match shape.dims() {
            [n] => (*n, 1),
            [c, h, w] => (*c, h * w),
            _ => {
                return Err(DbnError::InvalidConfig(format!(
                    "batch normalization expects [n] or [c, h, w] input, got {}",
                    shape
                )))
            }
        };

        Ok(Self {
            shape,
            channels,
            spatial,
            epsilon,
            momentum,
            training: false,
            gamma: Param::bias("gamma", vec![1.0f32; channels]),
            beta: Param::bias("beta", vec![0.0f32; channels]),
            running_mean: vec![0.0f32; channels],
            running_var: vec![1.0f32; channels],
            normalized: Vec::new(),
            inv_std: Vec::new(),
        })
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn gamma(&self) -> &[f32] {
        &self.gamma.value
    }

    pub fn beta(&self) -> &[f32] {
        &self.beta.value
    }

    pub fn running_mean(&self) -> &[f32] {
        &self.running_mean
    }

    pub fn running_var(&self) -> &[f32] {
        &self.running_var
    }

    /// Values of channel `c` across the batch, visited in a fixed order.
    fn channel_indices(&self, c: usize, batch_size: usize) -> impl Iterator<Item = usize> + '_ {
        let sample_len = self.channels * self.spatial;
        (0..batch_size).flat_map(move |b| {
            let start = b * sample_len + c * self.spatial;
            start..start + self.spatial
        })
    }
}

impl Layer for BatchNormLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::BatchNorm
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let total = batch_size * self.shape.len();
        check_len("input", input, total);
        check_len("output", output, total);

        let count = (batch_size * self.spatial) as f32;
        self.normalized.resize(total, 0.0);
        self.inv_std.resize(self.channels, 0.0);

        for c in 0..self.channels {
            let (mean, var) = if self.training && count > 0.0 {
                let mean =
                    self.channel_indices(c, batch_size).map(|i| input[i]).sum::<f32>() / count;
                let var = self
                    .channel_indices(c, batch_size)
                    .map(|i| (input[i] - mean) * (input[i] - mean))
                    .sum::<f32>()
                    / count;

                self.running_mean[c] =
                    self.momentum * self.running_mean[c] + (1.0 - self.momentum) * mean;
                self.running_var[c] =
                    self.momentum * self.running_var[c] + (1.0 - self.momentum) * var;
                (mean, var)
            } else {
                (self.running_mean[c], self.running_var[c])
            };

            let inv_std = 1.0 / (var + self.epsilon).sqrt();
            self.inv_std[c] = inv_std;
            let (g, b) = (self.gamma.value[c], self.beta.value[c]);
            let indices: Vec<usize> = self.channel_indices(c, batch_size).collect();
            for i in indices {
                let x_hat = (input[i] - mean) * inv_std;
                self.normalized[i] = x_hat;
                output[i] = g * x_hat + b;
            }
        }
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let total = batch_size * self.shape.len();
        check_len("grad_output", grad_output, total);
        check_len("grad_input", grad_input, total);
        check_len("cached normalized input", &self.normalized, total);

        let count = (batch_size * self.spatial) as f32;
        for c in 0..self.channels {
            let indices: Vec<usize> = self.channel_indices(c, batch_size).collect();
            let sum_g: f32 = indices.iter().map(|&i| grad_output[i]).sum();
            let sum_gx: f32 = indices.iter().map(|&i| grad_output[i] * self.normalized[i]).sum();

            self.gamma.grad[c] += sum_gx;
            self.beta.grad[c] += sum_g;

            let scale = self.gamma.value[c] * self.inv_std[c];
            if self.training {
                // Three-term gradient through the batch mean and variance
                for &i in &indices {
                    let centered = count * grad_output[i] - sum_g - self.normalized[i] * sum_gx;
                    grad_input[i] = scale / count * centered;
                }
            } else {
                for &i in &indices {
                    grad_input[i] = scale * grad_output[i];
                }
            }
        }
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.gamma, &self.beta]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.gamma, &mut self.beta]
    }

    fn buffers(&self) -> Vec<(&'static str, &[f32])> {
        vec![("running_mean", &self.running_mean), ("running_var", &self.running_var)]
    }

    fn buffers_mut(&mut self) -> Vec<(&'static str, &mut Vec<f32>)> {
        vec![
            ("running_mean", &mut self.running_mean),
            ("running_var", &mut self.running_var),
        ]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}
