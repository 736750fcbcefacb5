//! Parameter update rules
//!
//! Optimizers turn the gradient accumulated in a [`Param`] into an in-place
//! parameter update, using the per-parameter [`ParamState`] held by the training
//! context (momentum buffers, second moments).
//!
//! # Available Optimizers
//!
//! - [`Sgd`]: momentum SGD, `velocity = momentum·velocity + lr·grad; w -= velocity`
//! - [`Adam`]: adaptive moment estimation
//!
//! Both apply the configured [`WeightDecay`] penalty to the gradient of
//! decaying parameters (weights, never biases) before accumulation.

pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use crate::config::OptimizerConfig;
use crate::layers::Param;
use crate::trainers::ParamState;
use serde::{Deserialize, Serialize};

/// Weight-decay regularisation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WeightDecay {
    #[default]
    None,
    L1 { cost: f32 },
    L2 { cost: f32 },
    L1L2 { l1: f32, l2: f32 },
}

impl WeightDecay {
    /// Derivative of the penalty at `w`, added to the descent gradient.
    pub fn penalty(&self, w: f32) -> f32 {
        match *self {
            WeightDecay::None => 0.0,
            WeightDecay::L1 { cost } => cost * sign(w),
            WeightDecay::L2 { cost } => cost * w,
            WeightDecay::L1L2 { l1, l2 } => l1 * sign(w) + l2 * w,
        }
    }
}

fn sign(w: f32) -> f32 {
    if w > 0.0 {
        1.0
    } else if w < 0.0 {
        -1.0
    } else {
        0.0
    }
}

/// Core trait for parameter update rules.
pub trait Optimizer: Send {
    /// Apply the accumulated gradient of `param` and clear it.
    ///
    /// The gradient must already be averaged over the batch. Calling this twice
    /// for one accumulated gradient is a no-op the second time for plain SGD
    /// without momentum, but not in general; trainers call it exactly once.
    fn update(&self, param: &mut Param, state: &mut ParamState);

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// Build the optimizer selected by the configuration.
pub fn from_config(
    config: &OptimizerConfig,
    learning_rate: f32,
    momentum: f32,
    weight_decay: WeightDecay,
) -> Box<dyn Optimizer> {
    match *config {
        OptimizerConfig::Sgd => Box::new(Sgd::new(learning_rate, momentum, weight_decay)),
        OptimizerConfig::Adam { beta1, beta2, epsilon } => {
            Box::new(Adam::new(learning_rate, beta1, beta2, epsilon, weight_decay))
        }
    }
}

/// Descent gradient of one element including the decay penalty.
#[inline]
pub(crate) fn decayed_gradient(param: &Param, decay: &WeightDecay, i: usize) -> f32 {
    if param.decays() {
        param.grad[i] + decay.penalty(param.value[i])
    } else {
        param.grad[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_decay_penalties() {
        assert_eq!(WeightDecay::None.penalty(3.0), 0.0);
        assert_eq!(WeightDecay::L2 { cost: 0.5 }.penalty(2.0), 1.0);
        assert_eq!(WeightDecay::L1 { cost: 0.5 }.penalty(-2.0), -0.5);
        assert_eq!(WeightDecay::L1L2 { l1: 1.0, l2: 1.0 }.penalty(2.0), 3.0);
    }
}
