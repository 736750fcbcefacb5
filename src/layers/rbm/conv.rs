//! Convolutional RBM layer.

use super::{check_units, visible_bias_from_mean, HiddenUnit, MeanField, Rbm, VisibleUnit};
use crate::error::{DbnError, Result};
use crate::layers::conv2d::add_channel_bias;
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::kernels::{
    channel_sums_acc, conv2d_backward_input, conv2d_backward_weights, conv2d_forward, ConvGeometry,
};
use crate::utils::SeededRng;
use serde::{Deserialize, Serialize};

/// Static configuration of a convolutional RBM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvRbmConfig {
    pub channels: usize,
    pub visible_height: usize,
    pub visible_width: usize,
    pub filters: usize,
    pub kernel_size: usize,
    #[serde(default)]
    pub visible: VisibleUnit,
    #[serde(default)]
    pub hidden: HiddenUnit,
    /// Side of the square probabilistic max pooling blocks.
    #[serde(default)]
    pub pooling: Option<usize>,
}

impl ConvRbmConfig {
    /// Binary units, no pooling.
    pub fn new(
        channels: usize,
        visible_height: usize,
        visible_width: usize,
        filters: usize,
        kernel_size: usize,
    ) -> Self {
        Self {
            channels,
            visible_height,
            visible_width,
            filters,
            kernel_size,
            visible: VisibleUnit::Binary,
            hidden: HiddenUnit::Binary,
            pooling: None,
        }
    }

    pub fn with_units(mut self, visible: VisibleUnit, hidden: HiddenUnit) -> Self {
        self.visible = visible;
        self.hidden = hidden;
        self
    }

    pub fn with_pooling(mut self, block: usize) -> Self {
        self.pooling = Some(block);
        self
    }
}

/// Convolutional Restricted Boltzmann Machine.
///
/// Visible samples are `[channels, h, w]`, hidden samples
/// `[filters, h - k + 1, w - k + 1]` (valid correlation). Biases are shared per
/// feature map. With pooling, the output is `[filters, hh / p, hw / p]`.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{ConvRbmConfig, ConvRbmLayer, Layer};
/// use rust_dbn::utils::SeededRng;
///
/// let mut rng = SeededRng::new(42);
/// let config = ConvRbmConfig::new(1, 28, 28, 20, 9).with_pooling(2);
/// let rbm = ConvRbmLayer::new(config, &mut rng).unwrap();
/// assert_eq!(rbm.output_shape().dims(), &[20, 10, 10]);
/// ```
pub struct ConvRbmLayer {
    config: ConvRbmConfig,
    geometry: ConvGeometry,
    groups: Option<Vec<Vec<usize>>>,
    weights: Param,
    hidden_biases: Param,
    visible_biases: Param,
    cache: MeanField,
}

impl ConvRbmLayer {
    pub fn new(config: ConvRbmConfig, rng: &mut SeededRng) -> Result<Self> {
        if config.channels == 0 || config.filters == 0 {
            return Err(DbnError::InvalidConfig(
                "convolutional RBM needs channels and filters".into(),
            ));
        }
        check_units(config.visible, config.hidden, config.pooling)?;
        let geometry = ConvGeometry::new(
            config.channels,
            config.visible_height,
            config.visible_width,
            config.filters,
            config.kernel_size,
            config.kernel_size,
            1,
            0,
        )
        .ok_or_else(|| {
            DbnError::InvalidConfig(format!(
                "kernel {} does not fit a {}x{} visible layer",
                config.kernel_size, config.visible_height, config.visible_width
            ))
        })?;

        let groups = match config.pooling {
            Some(p) => {
                let (hh, hw) = (geometry.out_height, geometry.out_width);
                if hh % p != 0 || hw % p != 0 {
                    return Err(DbnError::InvalidConfig(format!(
                        "pooling block {} does not divide hidden maps of {}x{}",
                        p, hh, hw
                    )));
                }
                let mut groups = Vec::with_capacity(config.filters * (hh / p) * (hw / p));
                for k in 0..config.filters {
                    for py in 0..hh / p {
                        for px in 0..hw / p {
                            let mut group = Vec::with_capacity(p * p);
                            for dy in 0..p {
                                for dx in 0..p {
                                    group.push((k * hh + py * p + dy) * hw + px * p + dx);
                                }
                            }
                            groups.push(group);
                        }
                    }
                }
                Some(groups)
            }
            None => None,
        };

        let weights = (0..geometry.weight_len()).map(|_| rng.normal(0.0, 0.01)).collect();

        Ok(Self {
            config,
            geometry,
            groups,
            weights: Param::weights("filters", weights),
            hidden_biases: Param::bias("hidden_biases", vec![0.0; config.filters]),
            visible_biases: Param::bias("visible_biases", vec![0.0; config.channels]),
            cache: MeanField::default(),
        })
    }

    pub fn config(&self) -> &ConvRbmConfig {
        &self.config
    }

    pub fn hidden_shape(&self) -> Shape {
        Shape::image(self.config.filters, self.geometry.out_height, self.geometry.out_width)
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights.value
    }

    fn hidden_spatial(&self) -> usize {
        self.geometry.out_height * self.geometry.out_width
    }

    fn visible_spatial(&self) -> usize {
        self.config.visible_height * self.config.visible_width
    }
}

impl Layer for ConvRbmLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::ConvRbm
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.config.channels, self.config.visible_height, self.config.visible_width)
    }

    fn output_shape(&self) -> Shape {
        match self.config.pooling {
            Some(p) => Shape::image(
                self.config.filters,
                self.geometry.out_height / p,
                self.geometry.out_width / p,
            ),
            None => self.hidden_shape(),
        }
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.geometry.input_len());
        check_len("output", output, batch_size * self.output_size());

        let mut activation = vec![0.0f32; batch_size * self.geometry.output_len()];
        self.hidden_activation(input, &mut activation, batch_size);
        self.cache.forward(
            self.config.hidden,
            self.groups.as_deref(),
            self.geometry.output_len(),
            activation,
            output,
        );
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let g = self.geometry;
        check_len("grad_output", grad_output, batch_size * self.output_size());
        check_len("grad_input", grad_input, batch_size * g.input_len());

        let delta = self
            .cache
            .backward(self.config.hidden, self.groups.as_deref(), g.output_len(), grad_output);
        conv2d_backward_weights(input, &delta, &mut self.weights.grad, &g, batch_size, 1.0);
        channel_sums_acc(&delta, &mut self.hidden_biases.grad, g.out_height * g.out_width, 1.0);
        conv2d_backward_input(&delta, &self.weights.value, grad_input, &g, batch_size);
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.weights, &self.hidden_biases, &self.visible_biases]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.weights, &mut self.hidden_biases, &mut self.visible_biases]
    }

    fn as_rbm_mut(&mut self) -> Option<&mut dyn Rbm> {
        Some(self)
    }
}

impl Rbm for ConvRbmLayer {
    fn visible_unit(&self) -> VisibleUnit {
        self.config.visible
    }

    fn hidden_unit(&self) -> HiddenUnit {
        self.config.hidden
    }

    fn num_visible(&self) -> usize {
        self.geometry.input_len()
    }

    fn num_hidden(&self) -> usize {
        self.geometry.output_len()
    }

    fn hidden_groups(&self) -> Option<&[Vec<usize>]> {
        self.groups.as_deref()
    }

    fn hidden_activation(&self, visible: &[f32], activation: &mut [f32], batch_size: usize) {
        conv2d_forward(visible, &self.weights.value, activation, &self.geometry, batch_size);
        add_channel_bias(activation, &self.hidden_biases.value, self.hidden_spatial());
    }

    fn visible_activation(&self, hidden: &[f32], activation: &mut [f32], batch_size: usize) {
        conv2d_backward_input(hidden, &self.weights.value, activation, &self.geometry, batch_size);
        add_channel_bias(activation, &self.visible_biases.value, self.visible_spatial());
    }

    fn accumulate_statistics(
        &mut self,
        visible: &[f32],
        hidden: &[f32],
        batch_size: usize,
        weight: f32,
    ) {
        let (hs, vs) = (self.hidden_spatial(), self.visible_spatial());
        conv2d_backward_weights(
            visible,
            hidden,
            &mut self.weights.grad,
            &self.geometry,
            batch_size,
            weight,
        );
        channel_sums_acc(visible, &mut self.visible_biases.grad, vs, weight);
        channel_sums_acc(hidden, &mut self.hidden_biases.grad, hs, weight);
    }

    fn hidden_bias_activity(&self, hidden: &[f32], batch_size: usize) -> Vec<f32> {
        let spatial = self.hidden_spatial();
        let mut activity = vec![0.0f32; self.config.filters];
        if batch_size > 0 && spatial > 0 {
            channel_sums_acc(hidden, &mut activity, spatial, 1.0 / (batch_size * spatial) as f32);
        }
        activity
    }

    fn hidden_biases_mut(&mut self) -> &mut Param {
        &mut self.hidden_biases
    }

    fn init_visible_biases(&mut self, data: &[f32], batch_size: usize) {
        let spatial = self.visible_spatial();
        if batch_size == 0 || spatial == 0 {
            return;
        }
        let mut means = vec![0.0f32; self.config.channels];
        channel_sums_acc(data, &mut means, spatial, 1.0 / (batch_size * spatial) as f32);
        for (b, m) in self.visible_biases.value.iter_mut().zip(means) {
            *b = visible_bias_from_mean(self.config.visible, m);
        }
    }
}
