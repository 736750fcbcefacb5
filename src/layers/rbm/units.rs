//! Unit types of RBM layers and their mean-field / sampling rules.
//!
//! All functions work on flat batches where each sample holds `sample_len`
//! units. Probabilistic max pooling groups are given as index lists within one
//! sample.

use crate::utils::activations::{sigmoid, sigmoid_derivative};
use crate::utils::SeededRng;
use serde::{Deserialize, Serialize};

/// Distribution of the visible units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VisibleUnit {
    /// Bernoulli units, mean `sigmoid(a)`.
    #[default]
    Binary,
    /// Unit-variance Gaussian units, mean `a`.
    Gaussian,
}

/// Distribution of the hidden units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HiddenUnit {
    /// Bernoulli units, mean `sigmoid(a)`.
    #[default]
    Binary,
    /// Noisy rectified linear units: mean `max(0, a)`, sample
    /// `max(0, a + N(0, sigmoid(a)))`.
    Relu,
    /// Unit-variance Gaussian units, mean `a`.
    Gaussian,
}

impl VisibleUnit {
    pub fn mean(self, a: f32) -> f32 {
        match self {
            VisibleUnit::Binary => sigmoid(a),
            VisibleUnit::Gaussian => a,
        }
    }

    pub fn sample(self, a: f32, mean: f32, rng: &mut SeededRng) -> f32 {
        match self {
            VisibleUnit::Binary => rng.bernoulli(mean),
            VisibleUnit::Gaussian => rng.normal(a, 1.0),
        }
    }
}

impl HiddenUnit {
    pub fn mean(self, a: f32) -> f32 {
        match self {
            HiddenUnit::Binary => sigmoid(a),
            HiddenUnit::Relu => a.max(0.0),
            HiddenUnit::Gaussian => a,
        }
    }

    pub fn sample(self, a: f32, mean: f32, rng: &mut SeededRng) -> f32 {
        match self {
            HiddenUnit::Binary => rng.bernoulli(mean),
            HiddenUnit::Relu => rng.normal(a, sigmoid(a).sqrt()).max(0.0),
            HiddenUnit::Gaussian => rng.normal(a, 1.0),
        }
    }

    /// Derivative of the mean w.r.t. the activation, from both.
    pub fn derivative(self, a: f32, mean: f32) -> f32 {
        match self {
            HiddenUnit::Binary => sigmoid_derivative(mean),
            HiddenUnit::Relu => {
                if a > 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            HiddenUnit::Gaussian => 1.0,
        }
    }
}

/// Probabilities of one pooling group: `p_i = exp(a_i) / (1 + Σ exp(a_j))`,
/// computed with the maximum (and the "off" state's zero) subtracted. Returns
/// the probability that any unit of the group is on.
fn group_softmax(activation: &[f32], group: &[usize], probs: &mut [f32]) -> f32 {
    let max = group.iter().map(|&i| activation[i]).fold(0.0f32, f32::max);
    let off = (-max).exp();
    let denom = off + group.iter().map(|&i| (activation[i] - max).exp()).sum::<f32>();
    for &i in group {
        probs[i] = (activation[i] - max).exp() / denom;
    }
    1.0 - off / denom
}

/// Mean-field hidden values for a batch of activations.
pub fn hidden_means(
    unit: HiddenUnit,
    groups: Option<&[Vec<usize>]>,
    sample_len: usize,
    activation: &[f32],
    means: &mut [f32],
) {
    assert_eq!(activation.len(), means.len());
    match groups {
        Some(groups) if sample_len > 0 => {
            for (act, out) in activation
                .chunks_exact(sample_len)
                .zip(means.chunks_exact_mut(sample_len))
            {
                for group in groups {
                    group_softmax(act, group, out);
                }
            }
        }
        _ => {
            for (m, &a) in means.iter_mut().zip(activation) {
                *m = unit.mean(a);
            }
        }
    }
}

/// Pooling-unit probabilities (one per group, groups in order) for a batch.
pub fn pool_means(
    groups: &[Vec<usize>],
    sample_len: usize,
    activation: &[f32],
    pooled: &mut [f32],
) {
    if sample_len == 0 || groups.is_empty() {
        return;
    }
    let mut scratch = vec![0.0f32; sample_len];
    for (act, out) in activation
        .chunks_exact(sample_len)
        .zip(pooled.chunks_exact_mut(groups.len()))
    {
        for (o, group) in out.iter_mut().zip(groups) {
            *o = group_softmax(act, group, &mut scratch);
        }
    }
}

/// Draw hidden states. Pooled groups pick at most one unit each.
pub fn sample_hidden(
    unit: HiddenUnit,
    groups: Option<&[Vec<usize>]>,
    sample_len: usize,
    activation: &[f32],
    means: &[f32],
    sample: &mut [f32],
    rng: &mut SeededRng,
) {
    match groups {
        Some(groups) if sample_len > 0 => {
            for (probs, out) in means
                .chunks_exact(sample_len)
                .zip(sample.chunks_exact_mut(sample_len))
            {
                for group in groups {
                    let u = rng.next_f32();
                    let mut cumulative = 0.0f32;
                    let mut chosen = None;
                    for &i in group {
                        out[i] = 0.0;
                        cumulative += probs[i];
                        if chosen.is_none() && u < cumulative {
                            chosen = Some(i);
                        }
                    }
                    if let Some(i) = chosen {
                        out[i] = 1.0;
                    }
                }
            }
        }
        _ => {
            for ((s, &a), &m) in sample.iter_mut().zip(activation).zip(means) {
                *s = unit.sample(a, m, rng);
            }
        }
    }
}

pub fn visible_means(unit: VisibleUnit, activation: &[f32], means: &mut [f32]) {
    for (m, &a) in means.iter_mut().zip(activation) {
        *m = unit.mean(a);
    }
}

pub fn sample_visible(
    unit: VisibleUnit,
    activation: &[f32],
    means: &[f32],
    sample: &mut [f32],
    rng: &mut SeededRng,
) {
    for ((s, &a), &m) in sample.iter_mut().zip(activation).zip(means) {
        *s = unit.sample(a, m, rng);
    }
}

/// Gradient w.r.t. the hidden activations of the pooling-unit outputs:
/// `dP/da_i = p_i · (1 - P)`.
pub fn pool_backward(
    groups: &[Vec<usize>],
    sample_len: usize,
    means: &[f32],
    pooled: &[f32],
    grad_pooled: &[f32],
    grad_activation: &mut [f32],
) {
    if sample_len == 0 || groups.is_empty() {
        return;
    }
    let n = groups.len();
    for (((probs, pool), gp), ga) in means
        .chunks_exact(sample_len)
        .zip(pooled.chunks_exact(n))
        .zip(grad_pooled.chunks_exact(n))
        .zip(grad_activation.chunks_exact_mut(sample_len))
    {
        ga.iter_mut().for_each(|v| *v = 0.0);
        for ((group, &p), &g) in groups.iter().zip(pool).zip(gp) {
            for &i in group {
                ga[i] = g * probs[i] * (1.0 - p);
            }
        }
    }
}
