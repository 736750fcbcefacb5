//! Per-run training state.

use crate::layers::{Layer, Param};
use crate::optimizers::Optimizer;
use crate::utils::SeededRng;

/// Optimizer state of one parameter tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamState {
    /// Momentum accumulator (first moment for Adam).
    pub velocity: Vec<f32>,
    /// Second moment estimate (Adam only).
    pub second_moment: Vec<f32>,
    /// Number of updates applied.
    pub step: u64,
}

impl ParamState {
    pub fn new(len: usize) -> Self {
        Self {
            velocity: vec![0.0; len],
            second_moment: vec![0.0; len],
            step: 0,
        }
    }
}

/// State attached to one layer for the duration of a training call.
#[derive(Debug, Clone, Default)]
pub struct LayerContext {
    /// One entry per trainable parameter, in `Layer::params` order.
    pub params: Vec<ParamState>,
    /// Running average of hidden activity per hidden bias (RBM sparsity).
    pub sparsity_average: Option<Vec<f32>>,
    /// Visible state of the persistent Markov chains (PCD).
    pub chains: Option<Vec<f32>>,
}

impl LayerContext {
    pub fn new(layer: &dyn Layer) -> Self {
        Self {
            params: layer.params().iter().map(|p| ParamState::new(p.len())).collect(),
            sparsity_average: None,
            chains: None,
        }
    }

    /// Apply the accumulated gradients of `layer` and clear them.
    pub fn apply(&mut self, layer: &mut dyn Layer, optimizer: &dyn Optimizer) {
        self.apply_params(layer.params_mut(), optimizer);
    }

    /// Same as [`apply`](Self::apply) for parameters already borrowed from a layer.
    pub fn apply_params(&mut self, params: Vec<&mut Param>, optimizer: &dyn Optimizer) {
        for (param, state) in params.into_iter().zip(self.params.iter_mut()) {
            optimizer.update(param, state);
        }
    }
}

/// Run-wide state shared by every layer of one training call.
pub struct TrainingContext {
    /// The run's single random stream (shuffling, Gibbs sampling).
    pub rng: SeededRng,
}

impl TrainingContext {
    /// Seed the run and hand every stochastic layer its own stream forked
    /// from it, so a run is reproducible from `seed` alone.
    pub fn new(layers: &mut [Box<dyn Layer>], seed: u64) -> Self {
        let mut rng = SeededRng::new(seed);
        for layer in layers.iter_mut().filter(|l| l.is_stochastic()) {
            layer.reseed(&mut rng);
        }
        Self { rng }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::DenseLayer;
    use crate::optimizers::{Sgd, WeightDecay};
    use crate::utils::Activation;

    #[test]
    fn test_layer_context_tracks_every_param() {
        let mut rng = SeededRng::new(1);
        let layer = DenseLayer::new(3, 2, Activation::Identity, &mut rng);
        let ctx = LayerContext::new(&layer);
        assert_eq!(ctx.params.len(), 2);
        assert_eq!(ctx.params[0].velocity.len(), 6);
        assert_eq!(ctx.params[1].velocity.len(), 2);
    }

    #[test]
    fn test_apply_consumes_gradients() {
        let mut rng = SeededRng::new(1);
        let mut layer = DenseLayer::new(1, 1, Activation::Identity, &mut rng);
        let before = layer.weights()[0];
        layer.params_mut()[0].grad[0] = 1.0;

        let mut ctx = LayerContext::new(&layer);
        ctx.apply(&mut layer, &Sgd::new(0.5, 0.0, WeightDecay::None));
        assert!((layer.weights()[0] - (before - 0.5)).abs() < 1e-6);
        assert_eq!(layer.params()[0].grad, vec![0.0]);
        assert_eq!(ctx.params[0].step, 1);
    }

    #[test]
    fn test_training_context_reseeds_stochastic_layers() {
        use crate::layers::DropoutLayer;
        use crate::shape::Shape;

        let masks = |seed: u64| {
            let mut rng = SeededRng::new(99);
            let mut layers: Vec<Box<dyn Layer>> =
                vec![Box::new(DropoutLayer::new(Shape::flat(64), 0.5, &mut rng).unwrap())];
            let _ctx = TrainingContext::new(&mut layers, seed);
            layers[0].set_training(true);
            let mut out = vec![0.0f32; 64];
            layers[0].forward(&[1.0; 64], &mut out, 1);
            out
        };
        assert_eq!(masks(3), masks(3));
        assert_ne!(masks(3), masks(4));
    }
}
