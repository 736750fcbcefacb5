//! Dense RBM layer.

use super::{check_units, visible_bias_from_mean, HiddenUnit, MeanField, Rbm, VisibleUnit};
use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::kernels::{add_bias_rows, matmul, matmul_at_acc, matmul_bt, sum_rows_acc};
use crate::utils::SeededRng;
use serde::{Deserialize, Serialize};

/// Static configuration of a dense RBM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RbmConfig {
    pub num_visible: usize,
    pub num_hidden: usize,
    #[serde(default)]
    pub visible: VisibleUnit,
    #[serde(default)]
    pub hidden: HiddenUnit,
    /// Size of the probabilistic max pooling groups (consecutive hidden units).
    #[serde(default)]
    pub pooling: Option<usize>,
}

impl RbmConfig {
    /// Binary visible and hidden units, no pooling.
    pub fn new(num_visible: usize, num_hidden: usize) -> Self {
        Self {
            num_visible,
            num_hidden,
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

    pub fn with_pooling(mut self, group_size: usize) -> Self {
        self.pooling = Some(group_size);
        self
    }
}

/// Dense Restricted Boltzmann Machine.
///
/// Weights are stored `num_visible × num_hidden` and start from N(0, 0.01²);
/// both bias vectors start at zero.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{Layer, RbmConfig, RbmLayer};
/// use rust_dbn::utils::SeededRng;
///
/// let mut rng = SeededRng::new(42);
/// let rbm = RbmLayer::new(RbmConfig::new(784, 500), &mut rng).unwrap();
/// assert_eq!(rbm.output_size(), 500);
/// assert_eq!(rbm.parameter_count(), 784 * 500 + 500 + 784);
/// ```
pub struct RbmLayer {
    config: RbmConfig,
    groups: Option<Vec<Vec<usize>>>,
    weights: Param,
    hidden_biases: Param,
    visible_biases: Param,
    cache: MeanField,
}

impl RbmLayer {
    pub fn new(config: RbmConfig, rng: &mut SeededRng) -> Result<Self> {
        if config.num_visible == 0 || config.num_hidden == 0 {
            return Err(DbnError::InvalidConfig("RBM needs visible and hidden units".into()));
        }
        check_units(config.visible, config.hidden, config.pooling)?;
        let groups = match config.pooling {
            Some(size) => {
                if config.num_hidden % size != 0 {
                    return Err(DbnError::InvalidConfig(format!(
                        "pooling size {} does not divide {} hidden units",
                        size, config.num_hidden
                    )));
                }
                Some(
                    (0..config.num_hidden / size)
                        .map(|g| (g * size..(g + 1) * size).collect())
                        .collect(),
                )
            }
            None => None,
        };

        let weights = (0..config.num_visible * config.num_hidden)
            .map(|_| rng.normal(0.0, 0.01))
            .collect();

        Ok(Self {
            config,
            groups,
            weights: Param::weights("weights", weights),
            hidden_biases: Param::bias("hidden_biases", vec![0.0; config.num_hidden]),
            visible_biases: Param::bias("visible_biases", vec![0.0; config.num_visible]),
            cache: MeanField::default(),
        })
    }

    pub fn config(&self) -> &RbmConfig {
        &self.config
    }

    pub fn weights(&self) -> &[f32] {
        &self.weights.value
    }

    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights.value
    }

    pub fn hidden_biases(&self) -> &[f32] {
        &self.hidden_biases.value
    }

    pub fn visible_biases(&self) -> &[f32] {
        &self.visible_biases.value
    }

    pub fn visible_biases_mut(&mut self) -> &mut [f32] {
        &mut self.visible_biases.value
    }
}

impl Layer for RbmLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Rbm
    }

    fn input_shape(&self) -> Shape {
        Shape::flat(self.config.num_visible)
    }

    fn output_shape(&self) -> Shape {
        match &self.groups {
            Some(groups) => Shape::flat(groups.len()),
            None => Shape::flat(self.config.num_hidden),
        }
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.config.num_visible);
        check_len("output", output, batch_size * self.output_size());

        let mut activation = vec![0.0f32; batch_size * self.config.num_hidden];
        self.hidden_activation(input, &mut activation, batch_size);
        self.cache.forward(
            self.config.hidden,
            self.groups.as_deref(),
            self.config.num_hidden,
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
        let (nv, nh) = (self.config.num_visible, self.config.num_hidden);
        check_len("grad_output", grad_output, batch_size * self.output_size());
        check_len("grad_input", grad_input, batch_size * nv);

        let delta = self
            .cache
            .backward(self.config.hidden, self.groups.as_deref(), nh, grad_output);
        matmul_at_acc(input, &delta, &mut self.weights.grad, batch_size, nv, nh, 1.0);
        sum_rows_acc(&delta, &mut self.hidden_biases.grad, nh, 1.0);
        matmul_bt(&delta, &self.weights.value, grad_input, batch_size, nh, nv);
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

impl Rbm for RbmLayer {
    fn visible_unit(&self) -> VisibleUnit {
        self.config.visible
    }

    fn hidden_unit(&self) -> HiddenUnit {
        self.config.hidden
    }

    fn num_visible(&self) -> usize {
        self.config.num_visible
    }

    fn num_hidden(&self) -> usize {
        self.config.num_hidden
    }

    fn hidden_groups(&self) -> Option<&[Vec<usize>]> {
        self.groups.as_deref()
    }

    fn hidden_activation(&self, visible: &[f32], activation: &mut [f32], batch_size: usize) {
        let (nv, nh) = (self.config.num_visible, self.config.num_hidden);
        matmul(visible, &self.weights.value, activation, batch_size, nv, nh);
        add_bias_rows(activation, &self.hidden_biases.value);
    }

    fn visible_activation(&self, hidden: &[f32], activation: &mut [f32], batch_size: usize) {
        let (nv, nh) = (self.config.num_visible, self.config.num_hidden);
        matmul_bt(hidden, &self.weights.value, activation, batch_size, nh, nv);
        add_bias_rows(activation, &self.visible_biases.value);
    }

    fn accumulate_statistics(
        &mut self,
        visible: &[f32],
        hidden: &[f32],
        batch_size: usize,
        weight: f32,
    ) {
        let (nv, nh) = (self.config.num_visible, self.config.num_hidden);
        matmul_at_acc(visible, hidden, &mut self.weights.grad, batch_size, nv, nh, weight);
        sum_rows_acc(visible, &mut self.visible_biases.grad, nv, weight);
        sum_rows_acc(hidden, &mut self.hidden_biases.grad, nh, weight);
    }

    fn hidden_bias_activity(&self, hidden: &[f32], batch_size: usize) -> Vec<f32> {
        let nh = self.config.num_hidden;
        let mut activity = vec![0.0f32; nh];
        if batch_size > 0 {
            sum_rows_acc(hidden, &mut activity, nh, 1.0 / batch_size as f32);
        }
        activity
    }

    fn hidden_biases_mut(&mut self) -> &mut Param {
        &mut self.hidden_biases
    }

    fn init_visible_biases(&mut self, data: &[f32], batch_size: usize) {
        let nv = self.config.num_visible;
        if batch_size == 0 {
            return;
        }
        let mut means = vec![0.0f32; nv];
        sum_rows_acc(data, &mut means, nv, 1.0 / batch_size as f32);
        for (b, m) in self.visible_biases.value.iter_mut().zip(means) {
            *b = visible_bias_from_mean(self.config.visible, m);
        }
    }
}
