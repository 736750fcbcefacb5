//! Adam (Adaptive Moment Estimation) optimizer implementation

use crate::layers::Param;
use crate::optimizers::{decayed_gradient, Optimizer, WeightDecay};
use crate::trainers::ParamState;

/// Adam optimizer.
///
/// ```text
/// m_t = β1 * m_{t-1} + (1 - β1) * g
/// v_t = β2 * v_{t-1} + (1 - β2) * g²
/// w  -= α * (m_t / (1 - β1^t)) / (√(v_t / (1 - β2^t)) + ε)
/// ```
///
/// The moment estimates live in the parameter's [`ParamState`]
/// (`velocity` holds m, `second_moment` holds v).
///
/// Kingma, D. P., & Ba, J. (2014). Adam: A method for stochastic optimization.
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    weight_decay: WeightDecay,
}

impl Adam {
    pub fn new(
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
        weight_decay: WeightDecay,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
            weight_decay,
        }
    }
}

impl Optimizer for Adam {
    fn update(&self, param: &mut Param, state: &mut ParamState) {
        assert_eq!(
            param.value.len(),
            state.velocity.len(),
            "Parameters and optimizer state must have the same length"
        );
        if state.second_moment.len() != state.velocity.len() {
            state.second_moment = vec![0.0; state.velocity.len()];
        }

        state.step += 1;
        let t = state.step as i32;
        let bias_correction1 = 1.0 - self.beta1.powi(t);
        let bias_correction2 = 1.0 - self.beta2.powi(t);

        for i in 0..param.value.len() {
            let g = decayed_gradient(param, &self.weight_decay, i);
            let m = self.beta1 * state.velocity[i] + (1.0 - self.beta1) * g;
            let v = self.beta2 * state.second_moment[i] + (1.0 - self.beta2) * g * g;
            state.velocity[i] = m;
            state.second_moment[i] = v;

            let m_hat = m / bias_correction1;
            let v_hat = v / bias_correction2;
            param.value[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
        param.zero_grad();
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.learning_rate = lr;
    }
}
