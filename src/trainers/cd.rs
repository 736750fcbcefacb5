//! Contrastive Divergence trainer
//!
//! Trains one RBM layer at a time. Every mini-batch goes through a positive
//! phase (hidden probabilities given the data), a negative phase of `k` Gibbs
//! steps started from the data (CD-k) or from persistent chains (PCD), and a
//! single update:
//!
//! ```text
//! ∇W = (⟨v hᵀ⟩_data − ⟨v hᵀ⟩_model)
//! velocity = momentum·velocity + lr·(−∇W + decay'(W))
//! W = W − velocity
//! ```
//!
//! Data statistics are averaged over the batch, model statistics over the
//! chains. Intermediate Gibbs steps propagate samples; the last step uses
//! probabilities for the statistics.

use crate::config::{SparsityConfig, TrainingConfig};
use crate::dataset::{for_each_batch, BatchSource};
use crate::error::{DbnError, Result};
use crate::layers::{Layer, Rbm};
use crate::optimizers::{self, Optimizer};
use crate::trainers::LayerContext;
use crate::utils::SeededRng;
use tracing::debug;

/// Statistics of one pretraining epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CdEpochStats {
    pub epoch: usize,
    /// Mean squared error of the deterministic reconstruction, averaged over
    /// visible units and samples.
    pub reconstruction_error: f32,
    /// Mean hidden activity on the data.
    pub hidden_activity: f32,
}

/// Contrastive Divergence / Persistent CD trainer.
pub struct CdTrainer {
    k: usize,
    persistent: bool,
    chains: Option<usize>,
    init_visible_biases: bool,
    sparsity: Option<SparsityConfig>,
    double_buffer: bool,
    optimizer: Box<dyn Optimizer>,
}

/// Scratch buffers of one Gibbs chain batch.
struct Gibbs {
    h_act: Vec<f32>,
    h_mean: Vec<f32>,
    h_sample: Vec<f32>,
    v_act: Vec<f32>,
    v_mean: Vec<f32>,
    v_sample: Vec<f32>,
}

impl Gibbs {
    fn new(rows: usize, nv: usize, nh: usize) -> Self {
        Self {
            h_act: vec![0.0; rows * nh],
            h_mean: vec![0.0; rows * nh],
            h_sample: vec![0.0; rows * nh],
            v_act: vec![0.0; rows * nv],
            v_mean: vec![0.0; rows * nv],
            v_sample: vec![0.0; rows * nv],
        }
    }

    fn hidden_from(&mut self, rbm: &dyn Rbm, visible: &[f32], rows: usize) {
        rbm.hidden_activation(visible, &mut self.h_act, rows);
        rbm.hidden_means(&self.h_act, &mut self.h_mean);
    }

    /// `k` alternating steps from the current hidden state. Leaves the final
    /// visible means in `v_mean`, the final visible sample in `v_sample` and
    /// the matching hidden means in `h_mean`.
    fn run(&mut self, rbm: &dyn Rbm, k: usize, rows: usize, rng: &mut SeededRng) {
        for step in 0..k {
            rbm.sample_hidden(&self.h_act, &self.h_mean, &mut self.h_sample, rng);
            rbm.visible_activation(&self.h_sample, &mut self.v_act, rows);
            rbm.visible_means(&self.v_act, &mut self.v_mean);
            rbm.sample_visible(&self.v_act, &self.v_mean, &mut self.v_sample, rng);

            let last = step + 1 == k;
            let visible = if last { &self.v_mean } else { &self.v_sample };
            rbm.hidden_activation(visible, &mut self.h_act, rows);
            rbm.hidden_means(&self.h_act, &mut self.h_mean);
        }
    }
}

impl CdTrainer {
    pub fn new(config: &TrainingConfig) -> Self {
        Self {
            k: config.cd.k.max(1),
            persistent: config.cd.persistent,
            chains: config.cd.chains,
            init_visible_biases: config.cd.init_visible_biases,
            sparsity: config.sparsity,
            double_buffer: config.double_buffer,
            optimizer: optimizers::from_config(
                &config.optimizer,
                config.cd_learning_rate(),
                config.cd_momentum(),
                config.weight_decay,
            ),
        }
    }

    /// Train `layer` for exactly `epochs` passes over `source`.
    ///
    /// `all_samples` is the whole (already transformed) training set, used to
    /// initialise the visible biases. Fails if `layer` is not an RBM or a batch
    /// does not match its visible units; updates committed before a failing
    /// batch are kept.
    pub fn train(
        &mut self,
        layer: &mut dyn Layer,
        source: &mut dyn BatchSource,
        all_samples: &[f32],
        epochs: usize,
        rng: &mut SeededRng,
    ) -> Result<Vec<CdEpochStats>> {
        let kind = layer.kind();
        let mut ctx = LayerContext::new(layer);
        let Some(rbm) = layer.as_rbm_mut() else {
            return Err(DbnError::Architecture(format!(
                "{:?} layer cannot be trained with CD",
                kind
            )));
        };
        let nv = rbm.num_visible();
        if source.sample_len() != nv {
            return Err(DbnError::DataShape {
                expected: nv,
                actual: source.sample_len(),
            });
        }

        rbm.params_mut().into_iter().for_each(|p| p.zero_grad());
        if self.init_visible_biases && !all_samples.is_empty() {
            rbm.init_visible_biases(all_samples, all_samples.len() / nv);
        }

        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            source.reset(rng);
            let mut error_sum = 0.0f32;
            let mut activity_sum = 0.0f32;
            let mut samples = 0usize;

            for_each_batch(source, self.double_buffer, |batch| {
                if batch.inputs.len() != batch.size * nv {
                    return Err(DbnError::DataShape {
                        expected: batch.size * nv,
                        actual: batch.inputs.len(),
                    });
                }
                let (error, activity) =
                    self.train_batch(rbm, &mut ctx, &batch.inputs, batch.size, rng);
                error_sum += error * batch.size as f32;
                activity_sum += activity * batch.size as f32;
                samples += batch.size;
                Ok(())
            })?;

            let n = samples.max(1) as f32;
            let stats = CdEpochStats {
                epoch,
                reconstruction_error: error_sum / n,
                hidden_activity: activity_sum / n,
            };
            debug!(
                epoch,
                reconstruction_error = stats.reconstruction_error,
                hidden_activity = stats.hidden_activity,
                "CD epoch finished"
            );
            history.push(stats);
        }
        Ok(history)
    }

    /// One positive phase, negative phase and update. Returns the batch's
    /// reconstruction error and mean hidden activity.
    pub fn train_batch(
        &self,
        rbm: &mut dyn Rbm,
        ctx: &mut LayerContext,
        visible: &[f32],
        batch_size: usize,
        rng: &mut SeededRng,
    ) -> (f32, f32) {
        let (nv, nh) = (rbm.num_visible(), rbm.num_hidden());
        let error = rbm.reconstruction_error(visible, batch_size);

        // Positive phase
        let mut positive = Gibbs::new(batch_size, nv, nh);
        positive.hidden_from(rbm, visible, batch_size);
        rbm.accumulate_statistics(visible, &positive.h_mean, batch_size, -1.0 / batch_size as f32);
        let activity = rbm.hidden_bias_activity(&positive.h_mean, batch_size);
        let mean_activity = activity.iter().sum::<f32>() / activity.len().max(1) as f32;

        // Negative phase
        if self.persistent {
            let rows = self.chains.unwrap_or(batch_size);
            let chains = ctx.chains.get_or_insert_with(|| {
                (0..rows)
                    .flat_map(|c| {
                        let row = (c % batch_size) * nv;
                        visible[row..row + nv].iter().copied()
                    })
                    .collect()
            });
            let mut negative = Gibbs::new(rows, nv, nh);
            negative.hidden_from(rbm, chains, rows);
            negative.run(rbm, self.k, rows, rng);
            chains.copy_from_slice(&negative.v_sample);
            rbm.accumulate_statistics(&negative.v_mean, &negative.h_mean, rows, 1.0 / rows as f32);
        } else {
            positive.run(rbm, self.k, batch_size, rng);
            rbm.accumulate_statistics(
                &positive.v_mean,
                &positive.h_mean,
                batch_size,
                1.0 / batch_size as f32,
            );
        }

        if let Some(sparsity) = self.sparsity {
            apply_sparsity(rbm, ctx, &activity, &sparsity);
        }

        ctx.apply_params(rbm.params_mut(), self.optimizer.as_ref());
        (error, mean_activity)
    }
}

/// Track the running hidden activity and pull it toward the target through the
/// hidden-bias gradient.
fn apply_sparsity(
    rbm: &mut dyn Rbm,
    ctx: &mut LayerContext,
    activity: &[f32],
    sparsity: &SparsityConfig,
) {
    let average = ctx.sparsity_average.get_or_insert_with(|| activity.to_vec());
    for (q, &a) in average.iter_mut().zip(activity) {
        *q = sparsity.decay * *q + (1.0 - sparsity.decay) * a;
    }
    let biases = rbm.hidden_biases_mut();
    for (g, &q) in biases.grad.iter_mut().zip(average.iter()) {
        *g += sparsity.cost * (q - sparsity.target);
    }
}
