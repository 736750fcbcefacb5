//! Output losses of the SGD trainer.

use serde::{Deserialize, Serialize};

const PROB_FLOOR: f32 = 1e-12;

/// Loss computed at the output layer.
///
/// The loss of a batch is the sum of per-sample losses; the gradient handed to
/// the output layer is `∂L/∂y` of each sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Loss {
    /// `-Σ t·ln(y)`, meant for softmax outputs.
    #[default]
    CrossEntropy,
    /// `½·Σ (y - t)²`, for regression and autoencoders.
    MeanSquaredError,
}

impl Loss {
    /// Sum of the losses over the batch; writes `∂L/∂y` into `grad`.
    pub fn compute(&self, output: &[f32], target: &[f32], grad: &mut [f32]) -> f32 {
        assert_eq!(output.len(), target.len(), "output and target length mismatch");
        assert_eq!(output.len(), grad.len(), "output and gradient length mismatch");

        let mut total = 0.0f32;
        match self {
            Loss::CrossEntropy => {
                for ((g, &y), &t) in grad.iter_mut().zip(output).zip(target) {
                    let y = y.max(PROB_FLOOR);
                    total -= t * y.ln();
                    *g = -t / y;
                }
            }
            Loss::MeanSquaredError => {
                for ((g, &y), &t) in grad.iter_mut().zip(output).zip(target) {
                    let diff = y - t;
                    total += 0.5 * diff * diff;
                    *g = diff;
                }
            }
        }
        total
    }
}

/// Cross-entropy of softmax outputs, writing the gradient w.r.t. the softmax
/// input (`y - t`) into `delta`.
///
/// Taking the two Jacobians together keeps the gradient intact when the
/// probability of the true class underflows.
pub fn softmax_cross_entropy(output: &[f32], target: &[f32], delta: &mut [f32]) -> f32 {
    assert_eq!(output.len(), target.len(), "output and target length mismatch");
    assert_eq!(output.len(), delta.len(), "output and delta length mismatch");

    let mut total = 0.0f32;
    for ((d, &y), &t) in delta.iter_mut().zip(output).zip(target) {
        total -= t * y.max(PROB_FLOOR).ln();
        *d = y - t;
    }
    total
}
