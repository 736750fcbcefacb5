//! Transposed 2D convolution.
//!
//! The layer scatters every input value through its filters, growing an
//! `[in_channels, h, w]` input to `[out_channels, (h - 1)·stride + k, (w - 1)·stride + k]`.
//! It is the adjoint of a valid correlation, so it reuses the correlation
//! kernels with input and output roles swapped.

use crate::error::{DbnError, Result};
use crate::layers::conv2d::{add_channel_bias, ConvConfig, Padding};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::kernels::{
    channel_sums_acc, conv2d_backward_input, conv2d_backward_weights, conv2d_forward, ConvGeometry,
};
use crate::utils::SeededRng;

/// Transposed convolution ("deconvolution") layer.
pub struct Deconv2DLayer {
    config: ConvConfig,
    /// Geometry of the adjoint correlation (output → input).
    adjoint: ConvGeometry,
    weights: Param,
    biases: Param,
    output_cache: Vec<f32>,
}

impl Deconv2DLayer {
    /// `config.padding` must be `Valid`.
    pub fn new(config: ConvConfig, rng: &mut SeededRng) -> Result<Self> {
        if config.padding != Padding::Valid {
            return Err(DbnError::InvalidConfig(
                "transposed convolution does not support padding".into(),
            ));
        }
        if config.stride == 0
            || config.kernel_size == 0
            || config.in_channels == 0
            || config.out_channels == 0
        {
            return Err(DbnError::InvalidConfig(
                "transposed convolution needs positive channels, kernel and stride".into(),
            ));
        }
        if config.input_height == 0 || config.input_width == 0 {
            return Err(DbnError::InvalidConfig("transposed convolution input is empty".into()));
        }
        let out_h = (config.input_height - 1) * config.stride + config.kernel_size;
        let out_w = (config.input_width - 1) * config.stride + config.kernel_size;
        let adjoint = ConvGeometry::new(
            config.out_channels,
            out_h,
            out_w,
            config.in_channels,
            config.kernel_size,
            config.kernel_size,
            config.stride,
            0,
        )
        .ok_or_else(|| DbnError::InvalidConfig("invalid transposed convolution geometry".into()))?;

        let k2 = (config.kernel_size * config.kernel_size) as f32;
        let limit = (6.0f32 / ((config.in_channels + config.out_channels) as f32 * k2)).sqrt();
        let weights = (0..adjoint.weight_len())
            .map(|_| rng.gen_range_f32(-limit, limit))
            .collect();

        Ok(Self {
            config,
            adjoint,
            weights: Param::weights("filters", weights),
            biases: Param::bias("biases", vec![0.0; config.out_channels]),
            output_cache: Vec::new(),
        })
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights.value
    }
}

impl Layer for Deconv2DLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Deconv2D
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.config.in_channels, self.config.input_height, self.config.input_width)
    }

    fn output_shape(&self) -> Shape {
        Shape::image(self.config.out_channels, self.adjoint.in_height, self.adjoint.in_width)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let g = self.adjoint;
        check_len("input", input, batch_size * g.output_len());
        check_len("output", output, batch_size * g.input_len());

        conv2d_backward_input(input, &self.weights.value, output, &g, batch_size);
        add_channel_bias(output, &self.biases.value, g.in_height * g.in_width);
        self.config.activation.apply(output, g.input_len());

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
        let g = self.adjoint;
        check_len("grad_output", grad_output, batch_size * g.input_len());
        check_len("grad_input", grad_input, batch_size * g.output_len());

        let mut delta = vec![0.0f32; grad_output.len()];
        self.config
            .activation
            .backward(&self.output_cache, grad_output, &mut delta, g.input_len());

        conv2d_backward_weights(&delta, input, &mut self.weights.grad, &g, batch_size, 1.0);
        channel_sums_acc(&delta, &mut self.biases.grad, g.in_height * g.in_width, 1.0);
        conv2d_forward(&delta, &self.weights.value, grad_input, &g, batch_size);
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weights, &self.biases]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.biases]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deconv_output_shape() {
        let mut rng = SeededRng::new(3);
        let layer =
            Deconv2DLayer::new(ConvConfig::new(2, 3, 3, 4, 5).with_stride(2), &mut rng).unwrap();
        assert_eq!(layer.output_shape(), Shape::image(3, 9, 11));
    }

    #[test]
    fn test_deconv_scatters_single_value() {
        let mut rng = SeededRng::new(3);
        let mut layer = Deconv2DLayer::new(ConvConfig::new(1, 1, 2, 1, 1), &mut rng).unwrap();
        layer.weights_mut().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        let mut out = vec![0.0; 4];
        layer.forward(&[2.0], &mut out, 1);
        assert_eq!(out, vec![2.0, 4.0, 6.0, 8.0]);
    }
}
