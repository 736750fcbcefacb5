//! Restricted Boltzmann Machine layers
//!
//! [`RbmLayer`] connects flat visible and hidden vectors through a weight
//! matrix; [`ConvRbmLayer`] shares filters across the spatial positions of its
//! feature maps. Both optionally group hidden units under probabilistic max
//! pooling units, in which case the layer's output is the pooling layer.
//!
//! As plain [`Layer`]s both compute deterministic mean-field activations. The
//! [`Rbm`] trait exposes the Gibbs-sampling primitives the Contrastive
//! Divergence trainer needs.

pub mod units;

mod conv;
mod dense;

pub use conv::{ConvRbmConfig, ConvRbmLayer};
pub use dense::{RbmConfig, RbmLayer};
pub use units::{HiddenUnit, VisibleUnit};

use crate::error::{DbnError, Result};
use crate::layers::{Layer, Param};
use crate::utils::SeededRng;

/// Sampling and statistics interface of RBM layers.
///
/// Batches are flat: `batch_size × num_visible()` visible values and
/// `batch_size × num_hidden()` hidden values. Statistics are accumulated into
/// the layer's [`Param`] gradients as descent gradients, so the caller chooses
/// the sign (data statistics negative, model statistics positive).
pub trait Rbm: Layer {
    fn visible_unit(&self) -> VisibleUnit;

    fn hidden_unit(&self) -> HiddenUnit;

    /// Visible units per sample.
    fn num_visible(&self) -> usize;

    /// Hidden units per sample (before pooling).
    fn num_hidden(&self) -> usize;

    /// Pooling groups as unit indices within one sample, if pooling is enabled.
    fn hidden_groups(&self) -> Option<&[Vec<usize>]>;

    /// Hidden pre-activations given visible values.
    fn hidden_activation(&self, visible: &[f32], activation: &mut [f32], batch_size: usize);

    /// Visible pre-activations given hidden values.
    fn visible_activation(&self, hidden: &[f32], activation: &mut [f32], batch_size: usize);

    /// Add `weight · ⟨v hᵀ⟩`, `weight · Σv` and `weight · Σh` to the weight,
    /// visible-bias and hidden-bias gradients.
    fn accumulate_statistics(
        &mut self,
        visible: &[f32],
        hidden: &[f32],
        batch_size: usize,
        weight: f32,
    );

    /// Mean hidden activity per hidden bias (per unit, or per feature map).
    fn hidden_bias_activity(&self, hidden: &[f32], batch_size: usize) -> Vec<f32>;

    fn hidden_biases_mut(&mut self) -> &mut Param;

    /// Set visible biases from the data: log-odds of the mean for binary units,
    /// the mean for Gaussian units.
    fn init_visible_biases(&mut self, data: &[f32], batch_size: usize);

    fn hidden_means(&self, activation: &[f32], means: &mut [f32]) {
        units::hidden_means(
            self.hidden_unit(),
            self.hidden_groups(),
            self.num_hidden(),
            activation,
            means,
        );
    }

    fn sample_hidden(
        &self,
        activation: &[f32],
        means: &[f32],
        sample: &mut [f32],
        rng: &mut SeededRng,
    ) {
        units::sample_hidden(
            self.hidden_unit(),
            self.hidden_groups(),
            self.num_hidden(),
            activation,
            means,
            sample,
            rng,
        );
    }

    fn visible_means(&self, activation: &[f32], means: &mut [f32]) {
        units::visible_means(self.visible_unit(), activation, means);
    }

    fn sample_visible(
        &self,
        activation: &[f32],
        means: &[f32],
        sample: &mut [f32],
        rng: &mut SeededRng,
    ) {
        units::sample_visible(self.visible_unit(), activation, means, sample, rng);
    }

    /// Mean squared error of the deterministic reconstruction `v → h → v`,
    /// averaged over visible units and samples.
    fn reconstruction_error(&self, visible: &[f32], batch_size: usize) -> f32 {
        let (nv, nh) = (self.num_visible(), self.num_hidden());
        if batch_size == 0 || nv == 0 {
            return 0.0;
        }
        let mut h_act = vec![0.0f32; batch_size * nh];
        let mut h = vec![0.0f32; batch_size * nh];
        self.hidden_activation(visible, &mut h_act, batch_size);
        self.hidden_means(&h_act, &mut h);

        let mut v_act = vec![0.0f32; batch_size * nv];
        let mut v = vec![0.0f32; batch_size * nv];
        self.visible_activation(&h, &mut v_act, batch_size);
        self.visible_means(&v_act, &mut v);

        let sse: f32 = visible.iter().zip(&v).map(|(a, b)| (a - b) * (a - b)).sum();
        sse / (batch_size * nv) as f32
    }
}

/// Reject unit combinations the samplers cannot handle.
pub(crate) fn check_units(
    visible: VisibleUnit,
    hidden: HiddenUnit,
    pooling: Option<usize>,
) -> Result<()> {
    if visible == VisibleUnit::Gaussian && hidden == HiddenUnit::Gaussian {
        return Err(DbnError::UnsupportedUnits(
            "gaussian visible units with gaussian hidden units".into(),
        ));
    }
    if let Some(size) = pooling {
        if size == 0 {
            return Err(DbnError::InvalidConfig("pooling size must be positive".into()));
        }
        if hidden != HiddenUnit::Binary {
            return Err(DbnError::UnsupportedUnits(format!(
                "probabilistic max pooling requires binary hidden units, got {:?}",
                hidden
            )));
        }
    }
    Ok(())
}

/// Visible bias from a data mean.
pub(crate) fn visible_bias_from_mean(unit: VisibleUnit, mean: f32) -> f32 {
    match unit {
        VisibleUnit::Binary => {
            let p = mean.clamp(1e-3, 1.0 - 1e-3);
            (p / (1.0 - p)).ln()
        }
        VisibleUnit::Gaussian => mean,
    }
}

/// Mean-field hidden state cached by an RBM's `forward` for its `backward`.
#[derive(Default)]
pub(crate) struct MeanField {
    activation: Vec<f32>,
    means: Vec<f32>,
    pooled: Vec<f32>,
}

impl MeanField {
    /// Turn pre-activations into the layer output: hidden means, or pooling
    /// unit probabilities when `groups` is set.
    pub(crate) fn forward(
        &mut self,
        unit: HiddenUnit,
        groups: Option<&[Vec<usize>]>,
        num_hidden: usize,
        activation: Vec<f32>,
        output: &mut [f32],
    ) {
        self.means.resize(activation.len(), 0.0);
        units::hidden_means(unit, groups, num_hidden, &activation, &mut self.means);
        match groups {
            Some(groups) => {
                self.pooled.resize(output.len(), 0.0);
                units::pool_means(groups, num_hidden, &activation, &mut self.pooled);
                output.copy_from_slice(&self.pooled);
            }
            None => output.copy_from_slice(&self.means),
        }
        self.activation = activation;
    }

    /// Gradient w.r.t. the hidden pre-activations.
    pub(crate) fn backward(
        &self,
        unit: HiddenUnit,
        groups: Option<&[Vec<usize>]>,
        num_hidden: usize,
        grad_output: &[f32],
    ) -> Vec<f32> {
        let mut grad = vec![0.0f32; self.activation.len()];
        match groups {
            Some(groups) => {
                assert_eq!(
                    self.pooled.len(),
                    grad_output.len(),
                    "backward called without a matching forward pass"
                );
                units::pool_backward(
                    groups,
                    num_hidden,
                    &self.means,
                    &self.pooled,
                    grad_output,
                    &mut grad,
                );
            }
            None => {
                assert_eq!(
                    grad.len(),
                    grad_output.len(),
                    "backward called without a matching forward pass"
                );
                for (((d, &g), &a), &m) in grad
                    .iter_mut()
                    .zip(grad_output)
                    .zip(&self.activation)
                    .zip(&self.means)
                {
                    *d = g * unit.derivative(a, m);
                }
            }
        }
        grad
    }
}
