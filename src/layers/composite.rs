//! Composite layers
//!
//! [`GroupLayer`] runs a fixed sub-stack as one layer; [`MergeLayer`] feeds the
//! same input to parallel branches and concatenates their outputs. These are the
//! only non-linear topologies the engine supports.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::{Activation, SeededRng};

/// Sequential sub-stack behaving as a single layer.
pub struct GroupLayer {
    layers: Vec<Box<dyn Layer>>,
    input_shape: Shape,
    output_shape: Shape,
    /// Output of every inner layer from the last forward pass.
    outputs: Vec<Vec<f32>>,
}

impl GroupLayer {
    /// Adjacent inner layers must have compatible shapes.
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Result<Self> {
        let (Some(first), Some(last)) = (layers.first(), layers.last()) else {
            return Err(DbnError::InvalidConfig("group must contain at least one layer".into()));
        };
        let (input_shape, output_shape) = (first.input_shape(), last.output_shape());
        for (index, pair) in layers.windows(2).enumerate() {
            let (output, input) = (pair[0].output_shape(), pair[1].input_shape());
            if !input.accepts(&output) {
                return Err(DbnError::ShapeMismatch { index, output, input });
            }
        }
        Ok(Self {
            layers,
            input_shape,
            output_shape,
            outputs: Vec::new(),
        })
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    /// Reverse pass over the inner layers; with `preactivation` the last one
    /// receives its gradient through [`Layer::backward_preactivation`].
    fn backward_inner(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
        preactivation: bool,
    ) {
        check_len("grad_output", grad_output, batch_size * self.output_size());
        check_len("grad_input", grad_input, batch_size * self.input_size());
        assert_eq!(
            self.outputs.len(),
            self.layers.len(),
            "backward called without a matching forward pass"
        );

        let last = self.layers.len().saturating_sub(1);
        let mut grad = grad_output.to_vec();
        for i in (0..self.layers.len()).rev() {
            let src = if i == 0 { input } else { self.outputs[i - 1].as_slice() };
            let mut grad_in = vec![0.0f32; batch_size * self.layers[i].input_size()];
            if preactivation && i == last {
                self.layers[i].backward_preactivation(src, &grad, &mut grad_in, batch_size);
            } else {
                self.layers[i].backward(src, &grad, &mut grad_in, batch_size);
            }
            grad = grad_in;
        }
        grad_input.copy_from_slice(&grad);
    }
}

impl Layer for GroupLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Group
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.output_shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.input_size());
        check_len("output", output, batch_size * self.output_size());

        self.outputs.clear();
        for i in 0..self.layers.len() {
            let mut out = vec![0.0f32; batch_size * self.layers[i].output_size()];
            let src = if i == 0 { input } else { self.outputs[i - 1].as_slice() };
            self.layers[i].forward(src, &mut out, batch_size);
            self.outputs.push(out);
        }
        if let Some(last) = self.outputs.last() {
            output.copy_from_slice(last);
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        self.backward_inner(input, grad_output, grad_input, batch_size, false);
    }

    fn output_activation(&self) -> Option<Activation> {
        self.layers.last().and_then(|l| l.output_activation())
    }

    fn backward_preactivation(
        &mut self,
        input: &[f32],
        grad_preactivation: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        self.backward_inner(input, grad_preactivation, grad_input, batch_size, true);
    }

    fn params(&self) -> Vec<&Param> {
        self.layers.iter().flat_map(|l| l.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.layers.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    fn buffers(&self) -> Vec<(&'static str, &[f32])> {
        self.layers.iter().flat_map(|l| l.buffers()).collect()
    }

    fn buffers_mut(&mut self) -> Vec<(&'static str, &mut Vec<f32>)> {
        self.layers.iter_mut().flat_map(|l| l.buffers_mut()).collect()
    }

    fn set_training(&mut self, training: bool) {
        self.layers.iter_mut().for_each(|l| l.set_training(training));
    }

    fn reseed(&mut self, rng: &mut SeededRng) {
        self.layers.iter_mut().for_each(|l| l.reseed(rng));
    }

    fn is_differentiable(&self) -> bool {
        self.layers.iter().all(|l| l.is_differentiable())
    }

    fn is_stochastic(&self) -> bool {
        self.layers.iter().any(|l| l.is_stochastic())
    }
}

/// Parallel branches over the same input, outputs concatenated per sample.
///
/// The output is flat: `[branch 0 values | branch 1 values | ...]`.
pub struct MergeLayer {
    branches: Vec<Box<dyn Layer>>,
    input_shape: Shape,
    outputs: Vec<Vec<f32>>,
}

impl MergeLayer {
    /// All branches must accept the same input shape.
    pub fn new(branches: Vec<Box<dyn Layer>>) -> Result<Self> {
        let Some(first) = branches.first() else {
            return Err(DbnError::InvalidConfig("merge must contain at least one branch".into()));
        };
        let input = first.input_shape();
        for (index, branch) in branches.iter().enumerate().skip(1) {
            if branch.input_shape() != input {
                return Err(DbnError::ShapeMismatch {
                    index,
                    output: input,
                    input: branch.input_shape(),
                });
            }
        }
        Ok(Self {
            branches,
            input_shape: input,
            outputs: Vec::new(),
        })
    }
}

impl Layer for MergeLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Merge
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.branches.iter().map(|b| b.output_size()).sum())
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let total = self.output_size();
        check_len("input", input, batch_size * self.input_size());
        check_len("output", output, batch_size * total);

        self.outputs.clear();
        let mut offset = 0;
        for branch in self.branches.iter_mut() {
            let len = branch.output_size();
            let mut out = vec![0.0f32; batch_size * len];
            branch.forward(input, &mut out, batch_size);
            for b in 0..batch_size {
                let dst = b * total + offset;
                output[dst..dst + len].copy_from_slice(&out[b * len..(b + 1) * len]);
            }
            offset += len;
            self.outputs.push(out);
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let total = self.output_size();
        check_len("grad_output", grad_output, batch_size * total);
        check_len("grad_input", grad_input, batch_size * self.input_size());

        grad_input.iter_mut().for_each(|g| *g = 0.0);
        let mut branch_grad_in = vec![0.0f32; grad_input.len()];
        let mut offset = 0;
        for branch in self.branches.iter_mut() {
            let len = branch.output_size();
            let mut branch_grad = Vec::with_capacity(batch_size * len);
            for b in 0..batch_size {
                let src = b * total + offset;
                branch_grad.extend_from_slice(&grad_output[src..src + len]);
            }
            branch.backward(input, &branch_grad, &mut branch_grad_in, batch_size);
            for (g, &v) in grad_input.iter_mut().zip(&branch_grad_in) {
                *g += v;
            }
            offset += len;
        }
    }

    fn params(&self) -> Vec<&Param> {
        self.branches.iter().flat_map(|l| l.params()).collect()
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        self.branches.iter_mut().flat_map(|l| l.params_mut()).collect()
    }

    fn buffers(&self) -> Vec<(&'static str, &[f32])> {
        self.branches.iter().flat_map(|l| l.buffers()).collect()
    }

    fn buffers_mut(&mut self) -> Vec<(&'static str, &mut Vec<f32>)> {
        self.branches.iter_mut().flat_map(|l| l.buffers_mut()).collect()
    }

    fn set_training(&mut self, training: bool) {
        self.branches.iter_mut().for_each(|l| l.set_training(training));
    }

    fn reseed(&mut self, rng: &mut SeededRng) {
        self.branches.iter_mut().for_each(|l| l.reseed(rng));
    }

    fn is_differentiable(&self) -> bool {
        self.branches.iter().all(|l| l.is_differentiable())
    }

    fn is_stochastic(&self) -> bool {
        self.branches.iter().any(|l| l.is_stochastic())
    }
}
