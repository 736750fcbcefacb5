//! 2D Convolutional layer implementation
//!
//! This module provides a Conv2DLayer that correlates `[channels, height, width]`
//! inputs with a bank of learnable filters, with either no padding ("valid") or
//! the padding that preserves the spatial extent at stride 1 ("same"). With a
//! larger stride, "same" yields `ceil(extent / stride)` outputs per axis.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::kernels::{
    channel_sums_acc, conv2d_backward_input, conv2d_backward_weights, conv2d_forward, ConvGeometry,
};
use crate::utils::{Activation, SeededRng};
use serde::{Deserialize, Serialize};

/// Border handling of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Padding {
    /// No padding; the output shrinks by `kernel_size - 1`.
    #[default]
    Valid,
    /// Zero padding of `(kernel_size - 1) / 2`; requires an odd kernel.
    Same,
}

/// Static configuration of a convolutional layer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub kernel_size: usize,
    #[serde(default = "default_stride")]
    pub stride: usize,
    #[serde(default)]
    pub padding: Padding,
    pub input_height: usize,
    pub input_width: usize,
    #[serde(default)]
    pub activation: Activation,
}

fn default_stride() -> usize {
    1
}

impl ConvConfig {
    /// Valid correlation with stride 1 and no activation.
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        input_height: usize,
        input_width: usize,
    ) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            stride: 1,
            padding: Padding::Valid,
            input_height,
            input_width,
            activation: Activation::Identity,
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    fn geometry(&self) -> Result<ConvGeometry> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(DbnError::InvalidConfig(
                "convolution channels must be greater than 0".into(),
            ));
        }
        let pad = match self.padding {
            Padding::Valid => 0,
            Padding::Same => {
                if self.kernel_size % 2 == 0 {
                    return Err(DbnError::InvalidConfig(
                        "same padding requires an odd kernel".into(),
                    ));
                }
                (self.kernel_size - 1) / 2
            }
        };
        ConvGeometry::new(
            self.in_channels,
            self.input_height,
            self.input_width,
            self.out_channels,
            self.kernel_size,
            self.kernel_size,
            self.stride,
            pad,
        )
        .ok_or_else(|| {
            DbnError::InvalidConfig(format!(
                "kernel {}x{} with stride {} does not fit a {}x{} input",
                self.kernel_size, self.kernel_size, self.stride, self.input_height, self.input_width
            ))
        })
    }
}

/// 2D Convolutional layer with learnable filters.
///
/// Filters are stored as `[out_channels, in_channels, kernel, kernel]`, biases
/// as one value per output channel.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{Conv2DLayer, ConvConfig, Layer, Padding};
/// use rust_dbn::utils::SeededRng;
///
/// let mut rng = SeededRng::new(42);
/// let config = ConvConfig::new(1, 8, 3, 28, 28).with_padding(Padding::Same);
/// let layer = Conv2DLayer::new(config, &mut rng).unwrap();
/// assert_eq!(layer.output_shape().dims(), &[8, 28, 28]);
/// ```
pub struct Conv2DLayer {
    config: ConvConfig,
    geometry: ConvGeometry,
    weights: Param,
    biases: Param,
    output_cache: Vec<f32>,
}

impl Conv2DLayer {
    /// Create a new Conv2DLayer with Xavier initialization adapted for
    /// convolutions (fan_in = in_channels × k², fan_out = out_channels × k²).
    pub fn new(config: ConvConfig, rng: &mut SeededRng) -> Result<Self> {
        let geometry = config.geometry()?;
        let k2 = (config.kernel_size * config.kernel_size) as f32;
        let fan_in = config.in_channels as f32 * k2;
        let fan_out = config.out_channels as f32 * k2;
        let limit = (6.0f32 / (fan_in + fan_out)).sqrt();

        let weights = (0..geometry.weight_len())
            .map(|_| rng.gen_range_f32(-limit, limit))
            .collect();

        Ok(Self {
            config,
            geometry,
            weights: Param::weights("filters", weights),
            biases: Param::bias("biases", vec![0.0f32; config.out_channels]),
            output_cache: Vec::new(),
        })
    }

    pub fn config(&self) -> &ConvConfig {
        &self.config
    }

    pub fn output_height(&self) -> usize {
        self.geometry.out_height
    }

    pub fn output_width(&self) -> usize {
        self.geometry.out_width
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights.value
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights.value
    }

    pub fn biases_mut(&mut self) -> &mut [f32] {
        &mut self.biases.value
    }
}

/// Add one bias per channel to a batch of `[channels, spatial]` maps.
pub(crate) fn add_channel_bias(data: &mut [f32], bias: &[f32], spatial: usize) {
    let sample_len = bias.len() * spatial;
    if sample_len == 0 {
        return;
    }
    for sample in data.chunks_exact_mut(sample_len) {
        for (map, &b) in sample.chunks_exact_mut(spatial).zip(bias) {
            map.iter_mut().for_each(|v| *v += b);
        }
    }
}

impl Layer for Conv2DLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Conv2D
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.config.in_channels, self.config.input_height, self.config.input_width)
    }

    fn output_shape(&self) -> Shape {
        Shape::image(self.config.out_channels, self.geometry.out_height, self.geometry.out_width)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let g = self.geometry;
        check_len("input", input, batch_size * g.input_len());
        check_len("output", output, batch_size * g.output_len());

        conv2d_forward(input, &self.weights.value, output, &g, batch_size);
        add_channel_bias(output, &self.biases.value, g.out_height * g.out_width);
        self.config.activation.apply(output, g.output_len());

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
        let g = self.geometry;
        check_len("grad_output", grad_output, batch_size * g.output_len());
        check_len("grad_input", grad_input, batch_size * g.input_len());

        let mut delta = vec![0.0f32; grad_output.len()];
        self.config
            .activation
            .backward(&self.output_cache, grad_output, &mut delta, g.output_len());
        self.backward_preactivation(input, &delta, grad_input, batch_size);
    }

    fn output_activation(&self) -> Option<Activation> {
        Some(self.config.activation)
    }

    fn backward_preactivation(
        &mut self,
        input: &[f32],
        delta: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let g = self.geometry;
        check_len("delta", delta, batch_size * g.output_len());
        check_len("grad_input", grad_input, batch_size * g.input_len());

        conv2d_backward_weights(input, delta, &mut self.weights.grad, &g, batch_size, 1.0);
        channel_sums_acc(delta, &mut self.biases.grad, g.out_height * g.out_width, 1.0);
        conv2d_backward_input(delta, &self.weights.value, grad_input, &g, batch_size);
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weights, &self.biases]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }
}
