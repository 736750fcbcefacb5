//! Momentum stochastic gradient descent.

use crate::layers::Param;
use crate::optimizers::{decayed_gradient, Optimizer, WeightDecay};
use crate::trainers::ParamState;

/// Momentum SGD with weight decay.
///
/// For each element:
///
/// ```text
/// g = grad + decay'(w)          (decay only on weights)
/// velocity = momentum * velocity + learning_rate * g
/// w = w - velocity
/// ```
///
/// With `momentum = 0` this is vanilla SGD.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::Param;
/// use rust_dbn::optimizers::{Optimizer, Sgd, WeightDecay};
/// use rust_dbn::trainers::ParamState;
///
/// let optimizer = Sgd::new(0.1, 0.0, WeightDecay::None);
/// let mut param = Param::weights("w", vec![1.0, 2.0, 3.0]);
/// param.grad.copy_from_slice(&[0.1, 0.2, 0.3]);
/// let mut state = ParamState::new(3);
///
/// optimizer.update(&mut param, &mut state);
/// assert!((param.value[0] - 0.99).abs() < 1e-6);
/// assert_eq!(param.grad, vec![0.0; 3]);
/// ```
pub struct Sgd {
    learning_rate: f32,
    momentum: f32,
    weight_decay: WeightDecay,
}

impl Sgd {
    pub fn new(learning_rate: f32, momentum: f32, weight_decay: WeightDecay) -> Self {
        Self {
            learning_rate,
            momentum,
            weight_decay,
        }
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }
}

impl Optimizer for Sgd {
    fn update(&self, param: &mut Param, state: &mut ParamState) {
        assert_eq!(
            param.value.len(),
            state.velocity.len(),
            "Parameters and optimizer state must have the same length"
        );

        for i in 0..param.value.len() {
            let g = decayed_gradient(param, &self.weight_decay, i);
            let v = self.momentum * state.velocity[i] + self.learning_rate * g;
            state.velocity[i] = v;
            param.value[i] -= v;
        }
        state.step += 1;
        param.zero_grad();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
