//! Dropout layer implementation for regularization
//!
//! This module provides a DropoutLayer that randomly drops (sets to zero) a fraction
//! of input units during training to prevent overfitting. During inference, all units
//! are kept and outputs are passed through unchanged.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind};
use crate::shape::Shape;
use crate::utils::SeededRng;

/// Dropout layer for regularization.
///
/// During training, randomly sets a fraction of input units to zero with probability
/// `drop_rate`, and scales the remaining units by 1/(1-drop_rate) to maintain expected
/// values. During inference, passes inputs through unchanged.
///
/// The layer owns its random stream; trainers hand it a fresh one derived from the
/// run's seed through [`Layer::reseed`].
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{DropoutLayer, Layer};
/// use rust_dbn::utils::SeededRng;
/// use rust_dbn::Shape;
///
/// let mut rng = SeededRng::new(42);
/// let layer = DropoutLayer::new(Shape::flat(512), 0.5, &mut rng).unwrap();
/// assert_eq!(layer.input_size(), 512);
/// assert_eq!(layer.parameter_count(), 0);
/// ```
pub struct DropoutLayer {
    shape: Shape,
    drop_rate: f32,
    training: bool,
    mask: Vec<f32>,
    rng: SeededRng,
}

impl DropoutLayer {
    /// Creates a new dropout layer in inference mode.
    ///
    /// `drop_rate` must lie in `[0.0, 1.0)`.
    pub fn new(shape: Shape, drop_rate: f32, rng: &mut SeededRng) -> Result<Self> {
        if !(0.0..1.0).contains(&drop_rate) {
            return Err(DbnError::InvalidConfig(format!(
                "drop_rate must be in range [0.0, 1.0), got {}",
                drop_rate
            )));
        }

        Ok(Self {
            shape,
            drop_rate,
            training: false,
            mask: Vec::new(),
            rng: rng.fork(),
        })
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn drop_rate(&self) -> f32 {
        self.drop_rate
    }
}

impl Layer for DropoutLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Dropout
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let total_size = batch_size * self.shape.len();
        check_len("input", input, total_size);
        check_len("output", output, total_size);

        if !self.training {
            output.copy_from_slice(input);
            return;
        }

        // Inverted dropout: kept units are scaled so inference needs no rescaling
        let scale = 1.0 / (1.0 - self.drop_rate);
        self.mask.resize(total_size, 0.0);
        for ((m, o), &x) in self.mask.iter_mut().zip(output.iter_mut()).zip(input) {
            if self.rng.next_f32() >= self.drop_rate {
                *m = scale;
                *o = x * scale;
            } else {
                *m = 0.0;
                *o = 0.0;
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
        let total_size = batch_size * self.shape.len();
        check_len("grad_output", grad_output, total_size);
        check_len("grad_input", grad_input, total_size);

        if !self.training {
            grad_input.copy_from_slice(grad_output);
            return;
        }
        check_len("mask", &self.mask, total_size);
        for ((gi, &g), &m) in grad_input.iter_mut().zip(grad_output).zip(&self.mask) {
            *gi = g * m;
        }
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn reseed(&mut self, rng: &mut SeededRng) {
        self.rng = rng.fork();
    }

    fn is_stochastic(&self) -> bool {
        true
    }
}
