//! Layer trait definition
//!
//! This module defines the capability set every layer provides: shape
//! declaration, forward, backward, access to trainable parameters (consumed by
//! the optimizers) and the training/inference mode toggle.

use crate::layers::rbm::Rbm;
use crate::shape::Shape;
use crate::utils::{Activation, SeededRng};
use serde::{Deserialize, Serialize};

/// Tag identifying a layer variant, written next to every persisted layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Dense,
    Conv2D,
    Deconv2D,
    MaxPool2D,
    AvgPool2D,
    Upsample2D,
    Activation,
    Dropout,
    BatchNorm,
    Binarize,
    Scale,
    Lcn,
    Rectify,
    Reshape,
    Rnn,
    Lstm,
    Embedding,
    LastStep,
    Group,
    Merge,
    Rbm,
    ConvRbm,
}

/// A trainable tensor together with its accumulated gradient.
///
/// `grad` holds the *descent* gradient (the direction to subtract). Layers add
/// into it during `backward`; optimizers consume and clear it.
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    name: &'static str,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
    decay: bool,
}

impl Param {
    /// A weight tensor (subject to weight decay).
    pub fn weights(name: &'static str, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name,
            value,
            grad,
            decay: true,
        }
    }

    /// A bias vector (never decayed).
    pub fn bias(name: &'static str, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name,
            value,
            grad,
            decay: false,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn decays(&self) -> bool {
        self.decay
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn zero_grad(&mut self) {
        self.grad.iter_mut().for_each(|g| *g = 0.0);
    }

    pub fn scale_grad(&mut self, factor: f32) {
        self.grad.iter_mut().for_each(|g| *g *= factor);
    }
}

/// Core trait for layers.
///
/// Batches are flat row-major buffers of `batch_size × sample_len` values; a
/// sample's layout follows the layer's declared [`Shape`].
///
/// # Example
///
/// ```ignore
/// let mut output = vec![0.0f32; batch_size * layer.output_size()];
/// layer.forward(&input, &mut output, batch_size);
///
/// let mut grad_input = vec![0.0f32; batch_size * layer.input_size()];
/// layer.backward(&input, &grad_output, &mut grad_input, batch_size);
/// ```
pub trait Layer: Send {
    fn kind(&self) -> LayerKind;

    /// Shape of one input sample.
    fn input_shape(&self) -> Shape;

    /// Shape of one output sample, a pure function of the input shape and the
    /// static configuration.
    fn output_shape(&self) -> Shape;

    /// Forward propagation. Caches whatever `backward` needs.
    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize);

    /// Backward propagation.
    ///
    /// Only valid for the batch seen by the most recent `forward` call, with the
    /// same `input`. Writes the gradient w.r.t. the input into `grad_input` and
    /// adds parameter gradients into the layer's [`Param`]s.
    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    );

    /// Nonlinearity applied at the end of `forward`, for layers that fuse one.
    fn output_activation(&self) -> Option<Activation> {
        None
    }

    /// Like [`Layer::backward`], but `grad_preactivation` is already taken
    /// w.r.t. the input of [`Layer::output_activation`], whose Jacobian is
    /// skipped. The output loss uses it to hand softmax layers `y - t` directly.
    fn backward_preactivation(
        &mut self,
        input: &[f32],
        grad_preactivation: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        self.backward(input, grad_preactivation, grad_input, batch_size);
    }

    /// Trainable parameters in declaration order.
    fn params(&self) -> Vec<&Param> {
        Vec::new()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        Vec::new()
    }

    /// Non-trainable state that must be persisted (running statistics).
    fn buffers(&self) -> Vec<(&'static str, &[f32])> {
        Vec::new()
    }

    fn buffers_mut(&mut self) -> Vec<(&'static str, &mut Vec<f32>)> {
        Vec::new()
    }

    /// Switch between training and inference mode. Only dropout and batch
    /// normalisation observe the flag.
    fn set_training(&mut self, _training: bool) {}

    /// Give a stochastic layer a fresh random stream for a training run.
    fn reseed(&mut self, _rng: &mut SeededRng) {}

    /// Whether `backward` produces a meaningful gradient w.r.t. the input.
    fn is_differentiable(&self) -> bool {
        true
    }

    fn is_stochastic(&self) -> bool {
        false
    }

    /// Access the Contrastive Divergence interface of RBM layers.
    fn as_rbm_mut(&mut self) -> Option<&mut dyn Rbm> {
        None
    }

    fn input_size(&self) -> usize {
        self.input_shape().len()
    }

    fn output_size(&self) -> usize {
        self.output_shape().len()
    }

    fn parameter_count(&self) -> usize {
        self.params().iter().map(|p| p.len()).sum()
    }

    fn is_trainable(&self) -> bool {
        !self.params().is_empty()
    }
}

/// Check the buffer lengths a layer receives in `forward`/`backward`.
#[inline]
pub(crate) fn check_len(name: &str, buffer: &[f32], expected: usize) {
    assert_eq!(
        buffer.len(),
        expected,
        "{} len mismatch: expected {}, got {}",
        name,
        expected,
        buffer.len()
    );
}
