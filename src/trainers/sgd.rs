//! Mini-batch backpropagation trainer
//!
//! Per batch: a forward pass that keeps every layer's output, the loss at the
//! output layer, a strictly reverse-sequential backward pass, then one update
//! of every trainable layer with the batch-averaged gradients. The learning
//! rate schedule advances once per epoch.

use crate::config::TrainingConfig;
use crate::dataset::{for_each_batch, Batch, BatchSource};
use crate::error::{DbnError, Result};
use crate::layers::Layer;
use crate::optimizers::{self, Optimizer};
use crate::trainers::loss::softmax_cross_entropy;
use crate::trainers::{LayerContext, Loss};
use crate::utils::lr_scheduler::{self, LRScheduler};
use crate::utils::{Activation, SeededRng};
use tracing::debug;

/// Statistics of one fine-tuning epoch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpochStats {
    pub epoch: usize,
    /// Mean per-sample loss.
    pub loss: f32,
    /// Fraction of misclassified samples, when the targets are classes.
    pub error_rate: Option<f32>,
    /// Learning rate used during the epoch.
    pub learning_rate: f32,
}

/// Result of one batch step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchStats {
    /// Summed loss over the batch.
    pub loss: f32,
    /// Misclassified samples, when class labels were given.
    pub errors: Option<usize>,
}

/// Mini-batch SGD / backpropagation trainer over a whole layer stack.
pub struct SgdTrainer {
    loss: Loss,
    double_buffer: bool,
    optimizer: Box<dyn Optimizer>,
    scheduler: Box<dyn LRScheduler>,
    contexts: Vec<LayerContext>,
    /// First layer that backpropagation has to reach.
    first_trainable: usize,
    /// Cross-entropy over a softmax output layer, differentiated in one step.
    fused_softmax: bool,
}

impl SgdTrainer {
    /// Prepare a run over `layers`.
    ///
    /// Fails when a layer without an input gradient sits after a trainable
    /// layer, since the gradient could not reach the earlier parameters.
    pub fn new(layers: &[Box<dyn Layer>], config: &TrainingConfig) -> Result<Self> {
        let first_trainable = layers.iter().position(|l| l.is_trainable()).unwrap_or(layers.len());
        for (index, layer) in layers.iter().enumerate().skip(first_trainable + 1) {
            if !layer.is_differentiable() {
                return Err(DbnError::Architecture(format!(
                    "layer {} ({:?}) has no input gradient but follows trainable layer {}",
                    index,
                    layer.kind(),
                    first_trainable
                )));
            }
        }

        Ok(Self {
            loss: config.loss,
            double_buffer: config.double_buffer,
            optimizer: optimizers::from_config(
                &config.optimizer,
                config.learning_rate,
                config.momentum,
                config.weight_decay,
            ),
            scheduler: lr_scheduler::from_config(&config.scheduler, config.learning_rate),
            contexts: layers.iter().map(|l| LayerContext::new(l.as_ref())).collect(),
            first_trainable,
            fused_softmax: config.loss == Loss::CrossEntropy
                && layers.last().and_then(|l| l.output_activation()) == Some(Activation::Softmax),
        })
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    /// Train for exactly `epochs` passes over `source`.
    pub fn train(
        &mut self,
        layers: &mut [Box<dyn Layer>],
        source: &mut dyn BatchSource,
        epochs: usize,
        rng: &mut SeededRng,
    ) -> Result<Vec<EpochStats>> {
        let (input_len, output_len) = stack_sizes(layers);
        if source.sample_len() != input_len {
            return Err(DbnError::DataShape {
                expected: input_len,
                actual: source.sample_len(),
            });
        }
        if source.target_len() != output_len {
            return Err(DbnError::DataShape {
                expected: output_len,
                actual: source.target_len(),
            });
        }

        let mut history = Vec::with_capacity(epochs);
        for epoch in 0..epochs {
            let learning_rate = self.scheduler.get_lr();
            self.optimizer.set_learning_rate(learning_rate);
            source.reset(rng);

            let mut loss_sum = 0.0f32;
            let mut samples = 0usize;
            let mut errors: Option<usize> = None;
            let double_buffer = self.double_buffer;
            for_each_batch(source, double_buffer, |batch| {
                let stats = self.train_batch(layers, &batch)?;
                loss_sum += stats.loss;
                samples += batch.size;
                if let Some(e) = stats.errors {
                    *errors.get_or_insert(0) += e;
                }
                Ok(())
            })?;

            let n = samples.max(1) as f32;
            let stats = EpochStats {
                epoch,
                loss: loss_sum / n,
                error_rate: errors.map(|e| e as f32 / n),
                learning_rate,
            };
            debug!(
                epoch,
                loss = stats.loss,
                error_rate = ?stats.error_rate,
                learning_rate,
                "SGD epoch finished"
            );
            history.push(stats);
            self.scheduler.step();
        }
        Ok(history)
    }

    /// Forward, backward and update for one batch.
    ///
    /// The batch is validated before any layer runs, so a malformed batch
    /// leaves the parameters untouched.
    pub fn train_batch(
        &mut self,
        layers: &mut [Box<dyn Layer>],
        batch: &Batch,
    ) -> Result<BatchStats> {
        let (input_len, output_len) = stack_sizes(layers);
        let n = batch.size;
        if n == 0 {
            return Ok(BatchStats { loss: 0.0, errors: None });
        }
        if batch.inputs.len() != n * input_len {
            return Err(DbnError::DataShape {
                expected: n * input_len,
                actual: batch.inputs.len(),
            });
        }
        if batch.targets.len() != n * output_len {
            return Err(DbnError::DataShape {
                expected: n * output_len,
                actual: batch.targets.len(),
            });
        }

        // Forward pass, keeping every output
        let mut activations: Vec<Vec<f32>> = Vec::with_capacity(layers.len() + 1);
        activations.push(batch.inputs.clone());
        for layer in layers.iter_mut() {
            let mut output = vec![0.0f32; n * layer.output_size()];
            layer.forward(&activations[activations.len() - 1], &mut output, n);
            activations.push(output);
        }

        let prediction = &activations[layers.len()];
        let mut grad = vec![0.0f32; prediction.len()];
        let loss = if self.fused_softmax {
            softmax_cross_entropy(prediction, &batch.targets, &mut grad)
        } else {
            self.loss.compute(prediction, &batch.targets, &mut grad)
        };
        let errors = batch
            .classes
            .as_ref()
            .map(|classes| count_errors(prediction, classes, output_len));

        // Backward pass in strict reverse order
        let output_layer = layers.len().saturating_sub(1);
        for i in (self.first_trainable..layers.len()).rev() {
            let mut grad_input = vec![0.0f32; n * layers[i].input_size()];
            if self.fused_softmax && i == output_layer {
                layers[i].backward_preactivation(&activations[i], &grad, &mut grad_input, n);
            } else {
                layers[i].backward(&activations[i], &grad, &mut grad_input, n);
            }
            grad = grad_input;
        }

        // Update with the batch-averaged gradients
        let scale = 1.0 / n as f32;
        for (layer, ctx) in layers.iter_mut().zip(self.contexts.iter_mut()) {
            if !layer.is_trainable() {
                continue;
            }
            for param in layer.params_mut() {
                param.scale_grad(scale);
            }
            ctx.apply(layer.as_mut(), self.optimizer.as_ref());
        }

        Ok(BatchStats { loss, errors })
    }
}

/// Values per sample at the input and output of a stack.
fn stack_sizes(layers: &[Box<dyn Layer>]) -> (usize, usize) {
    match (layers.first(), layers.last()) {
        (Some(first), Some(last)) => (first.input_size(), last.output_size()),
        _ => (0, 0),
    }
}

/// Index of the largest value; the first one wins ties.
pub(crate) fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate() {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn count_errors(outputs: &[f32], classes: &[usize], width: usize) -> usize {
    if width == 0 {
        return 0;
    }
    outputs
        .chunks_exact(width)
        .zip(classes)
        .filter(|(row, &label)| argmax(row) != label)
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{BinarizeLayer, DenseLayer};
    use crate::shape::Shape;
    use crate::utils::Activation;

    #[test]
    fn test_argmax_first_wins_ties() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7]), 1);
        assert_eq!(argmax(&[]), 0);
    }

    #[test]
    fn test_non_differentiable_after_trainable_rejected() {
        let mut rng = SeededRng::new(1);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(DenseLayer::new(2, 2, Activation::Sigmoid, &mut rng)),
            Box::new(BinarizeLayer::new(Shape::flat(2), 0.5)),
            Box::new(DenseLayer::new(2, 2, Activation::Softmax, &mut rng)),
        ];
        assert!(matches!(
            SgdTrainer::new(&layers, &TrainingConfig::default()),
            Err(DbnError::Architecture(_))
        ));
    }

    #[test]
    fn test_leading_binarize_allowed() {
        let mut rng = SeededRng::new(1);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(BinarizeLayer::new(Shape::flat(2), 0.5)),
            Box::new(DenseLayer::new(2, 2, Activation::Softmax, &mut rng)),
        ];
        assert!(SgdTrainer::new(&layers, &TrainingConfig::default()).is_ok());
    }

    #[test]
    fn test_malformed_batch_leaves_parameters_untouched() {
        let mut rng = SeededRng::new(1);
        let mut layers: Vec<Box<dyn Layer>> =
            vec![Box::new(DenseLayer::new(2, 2, Activation::Softmax, &mut rng))];
        let before: Vec<f32> = layers[0].params()[0].value.clone();
        let mut trainer = SgdTrainer::new(&layers, &TrainingConfig::default()).unwrap();

        let batch = Batch {
            inputs: vec![1.0; 3],
            targets: vec![1.0, 0.0],
            classes: None,
            size: 1,
        };
        assert!(matches!(
            trainer.train_batch(&mut layers, &batch),
            Err(DbnError::DataShape { .. })
        ));
        assert_eq!(layers[0].params()[0].value, before);
    }

    #[test]
    fn test_saturated_wrong_softmax_still_learns() {
        let mut rng = SeededRng::new(1);
        let mut dense = DenseLayer::new(1, 2, Activation::Softmax, &mut rng);
        dense.weights_mut().copy_from_slice(&[40.0, 0.0]);
        let mut layers: Vec<Box<dyn Layer>> = vec![Box::new(dense)];
        let mut config = TrainingConfig::default();
        config.learning_rate = 0.1;
        config.momentum = 0.0;
        let mut trainer = SgdTrainer::new(&layers, &config).unwrap();

        let batch = Batch {
            inputs: vec![1.0],
            targets: vec![0.0, 1.0],
            classes: Some(vec![1]),
            size: 1,
        };
        let stats = trainer.train_batch(&mut layers, &batch).unwrap();
        assert!(stats.loss > 20.0);
        assert_eq!(stats.errors, Some(1));

        let weights = &layers[0].params()[0].value;
        assert!((weights[1] - 0.1).abs() < 1e-3, "true-class weight {}", weights[1]);
        assert!((weights[0] - 39.9).abs() < 1e-3, "wrong-class weight {}", weights[0]);
    }

    #[test]
    fn test_fused_softmax_matches_separate_jacobians() {
        let build = || -> Vec<Box<dyn Layer>> {
            let mut rng = SeededRng::new(9);
            vec![Box::new(DenseLayer::new(3, 3, Activation::Softmax, &mut rng))]
        };
        let batch = Batch {
            inputs: vec![0.2, -0.4, 0.9, 0.5, 0.1, -0.3],
            targets: vec![0.0, 1.0, 0.0, 0.0, 0.0, 1.0],
            classes: Some(vec![1, 2]),
            size: 2,
        };
        let mut config = TrainingConfig::default();
        config.momentum = 0.0;

        let mut fused = build();
        let mut trainer = SgdTrainer::new(&fused, &config).unwrap();
        trainer.train_batch(&mut fused, &batch).unwrap();

        let mut separate = build();
        let mut trainer = SgdTrainer::new(&separate, &config).unwrap();
        trainer.fused_softmax = false;
        trainer.train_batch(&mut separate, &batch).unwrap();

        let a = &fused[0].params()[0].value;
        let b = &separate[0].params()[0].value;
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_step_reduces_loss() {
        let mut rng = SeededRng::new(4);
        let mut layers: Vec<Box<dyn Layer>> =
            vec![Box::new(DenseLayer::new(2, 2, Activation::Softmax, &mut rng))];
        let mut config = TrainingConfig::default();
        config.momentum = 0.0;
        let mut trainer = SgdTrainer::new(&layers, &config).unwrap();

        let batch = Batch {
            inputs: vec![1.0, 0.0, 0.0, 1.0],
            targets: vec![1.0, 0.0, 0.0, 1.0],
            classes: Some(vec![0, 1]),
            size: 2,
        };
        let first = trainer.train_batch(&mut layers, &batch).unwrap();
        let second = trainer.train_batch(&mut layers, &batch).unwrap();
        assert!(second.loss < first.loss);
    }
}
