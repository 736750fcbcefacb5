//! Embedding layer: token indices to dense vectors.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::SeededRng;

/// Looks up one learned vector per index.
///
/// Input samples are `[steps]` indices stored as `f32`, outputs `[steps, dim]`.
/// Indices must be whole numbers in `0..vocabulary`; anything else is a caller
/// error and panics. The layer has no gradient w.r.t. its indices.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{EmbeddingLayer, Layer};
/// use rust_dbn::utils::SeededRng;
///
/// let mut rng = SeededRng::new(1);
/// let layer = EmbeddingLayer::new(10, 100, 16, &mut rng).unwrap();
/// assert_eq!(layer.output_shape().dims(), &[10, 16]);
/// ```
pub struct EmbeddingLayer {
    steps: usize,
    vocabulary: usize,
    dim: usize,
    embeddings: Param,
}

impl EmbeddingLayer {
    /// Vectors start uniform in `[-1, 1)`.
    pub fn new(steps: usize, vocabulary: usize, dim: usize, rng: &mut SeededRng) -> Result<Self> {
        if vocabulary == 0 || dim == 0 {
            return Err(DbnError::InvalidConfig(
                "embedding needs a non-empty vocabulary and dimension".into(),
            ));
        }
        let values = (0..vocabulary * dim).map(|_| rng.gen_range_f32(-1.0, 1.0)).collect();
        Ok(Self {
            steps,
            vocabulary,
            dim,
            embeddings: Param::weights("embeddings", values),
        })
    }

    pub fn vocabulary(&self) -> usize {
        self.vocabulary
    }

    fn index(&self, value: f32) -> usize {
        assert!(
            value >= 0.0 && value.fract() == 0.0 && (value as usize) < self.vocabulary,
            "embedding index {} outside vocabulary of {}",
            value,
            self.vocabulary
        );
        value as usize
    }
}

impl Layer for EmbeddingLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Embedding
    }

    fn input_shape(&self) -> Shape {
        Shape::flat(self.steps)
    }

    fn output_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.dim)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.steps);
        check_len("output", output, batch_size * self.steps * self.dim);
        for (&token, out) in input.iter().zip(output.chunks_exact_mut(self.dim)) {
            let row = self.index(token) * self.dim;
            out.copy_from_slice(&self.embeddings.value[row..row + self.dim]);
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.steps * self.dim);
        check_len("grad_input", grad_input, batch_size * self.steps);
        for (&token, g) in input.iter().zip(grad_output.chunks_exact(self.dim)) {
            let row = self.index(token) * self.dim;
            for (acc, &v) in self.embeddings.grad[row..row + self.dim].iter_mut().zip(g) {
                *acc += v;
            }
        }
        grad_input.iter_mut().for_each(|g| *g = 0.0);
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.embeddings]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.embeddings]
    }

    fn is_differentiable(&self) -> bool {
        false
    }
}
