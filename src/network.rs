//! Network container
//!
//! A [`Network`] owns an ordered stack of layers whose adjacent shapes were
//! checked at construction. It runs greedy layer-wise pretraining of its RBM
//! layers, supervised fine-tuning of the whole stack and inference.

use crate::config::{validate_config, TrainingConfig};
use crate::dataset::{BatchSource, Dataset, InMemoryBatches, Labels};
use crate::error::{DbnError, Result};
use crate::layers::{Layer, LayerKind};
use crate::persistence;
use crate::shape::Shape;
use crate::trainers::sgd::argmax;
use crate::trainers::{CdEpochStats, CdTrainer, EpochStats, Loss, SgdTrainer, TrainingContext};
use std::path::Path;
use tracing::info;

fn is_rbm(layer: &dyn Layer) -> bool {
    matches!(layer.kind(), LayerKind::Rbm | LayerKind::ConvRbm)
}

/// Ordered layer stack plus the hyperparameters its trainers use.
pub struct Network {
    layers: Vec<Box<dyn Layer>>,
    config: TrainingConfig,
}

impl Network {
    /// Assemble a network, rejecting an empty stack, invalid hyperparameters
    /// and any adjacent pair whose shapes disagree.
    ///
    /// # Example
    ///
    /// ```
    /// use rust_dbn::config::TrainingConfig;
    /// use rust_dbn::layers::{DenseLayer, Layer};
    /// use rust_dbn::utils::{Activation, SeededRng};
    /// use rust_dbn::{DbnError, Network};
    ///
    /// let mut rng = SeededRng::new(7);
    /// let layers: Vec<Box<dyn Layer>> = vec![
    ///     Box::new(DenseLayer::new(784, 100, Activation::Sigmoid, &mut rng)),
    ///     Box::new(DenseLayer::new(50, 10, Activation::Softmax, &mut rng)),
    /// ];
    /// let err = Network::new(layers, TrainingConfig::default()).err();
    /// assert!(matches!(err, Some(DbnError::ShapeMismatch { index: 0, .. })));
    /// ```
    pub fn new(layers: Vec<Box<dyn Layer>>, config: TrainingConfig) -> Result<Self> {
        validate_config(&config)?;
        if layers.is_empty() {
            return Err(DbnError::InvalidConfig("network needs at least one layer".into()));
        }
        for (index, pair) in layers.windows(2).enumerate() {
            let output = pair[0].output_shape();
            let input = pair[1].input_shape();
            if !input.accepts(&output) {
                return Err(DbnError::ShapeMismatch { index, output, input });
            }
        }
        Ok(Self { layers, config })
    }

    pub fn layers(&self) -> &[Box<dyn Layer>] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [Box<dyn Layer>] {
        &mut self.layers
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    pub fn input_shape(&self) -> Shape {
        self.layers[0].input_shape()
    }

    pub fn output_shape(&self) -> Shape {
        self.layers[self.layers.len() - 1].output_shape()
    }

    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.parameter_count()).sum()
    }

    fn check_data(&self, data: &Dataset) -> Result<()> {
        let input = self.input_shape();
        if !input.accepts(data.shape()) {
            return Err(DbnError::DataShape {
                expected: input.len(),
                actual: data.sample_len(),
            });
        }
        Ok(())
    }

    fn set_training(&mut self, training: bool) {
        self.layers.iter_mut().for_each(|l| l.set_training(training));
    }

    /// Push `samples` through layers `range` in chunks of the configured batch
    /// size.
    fn forward_range(
        &mut self,
        range: std::ops::Range<usize>,
        samples: &[f32],
        count: usize,
    ) -> Vec<f32> {
        let mut current = samples.to_vec();
        let batch_size = self.config.batch_size;
        for layer in &mut self.layers[range] {
            let (in_len, out_len) = (layer.input_size(), layer.output_size());
            let mut next = vec![0.0f32; count * out_len];
            let mut start = 0;
            while start < count {
                let n = batch_size.min(count - start);
                layer.forward(
                    &current[start * in_len..(start + n) * in_len],
                    &mut next[start * out_len..(start + n) * out_len],
                    n,
                );
                start += n;
            }
            current = next;
        }
        current
    }

    /// Greedy layer-wise pretraining.
    ///
    /// Every RBM layer, in order, is trained with Contrastive Divergence for
    /// `epochs` passes over the data as transformed by the layers before it.
    /// Other layers pass the data through unchanged in inference mode. Returns
    /// the per-epoch statistics of each RBM.
    pub fn pretrain(&mut self, data: &Dataset, epochs: usize) -> Result<Vec<Vec<CdEpochStats>>> {
        self.check_data(data)?;
        self.set_training(false);

        let rbm_layers: Vec<usize> = (0..self.layers.len())
            .filter(|&i| is_rbm(self.layers[i].as_ref()))
            .collect();
        let mut run = TrainingContext::new(&mut self.layers, self.config.seed);
        let mut trainer = CdTrainer::new(&self.config);
        let mut history = Vec::with_capacity(rbm_layers.len());

        let mut current = data.as_slice().to_vec();
        let mut position = 0;
        for &index in &rbm_layers {
            current = self.forward_range(position..index, &current, data.len());
            position = index;

            let layer = &mut self.layers[index];
            let shape = layer.input_shape();
            let transformed = Dataset::new(shape.clone(), current.clone())?;
            info!(
                layer = index,
                kind = ?layer.kind(),
                input = %shape,
                samples = transformed.len(),
                epochs,
                "pretraining RBM layer"
            );
            let mut batches = InMemoryBatches::unlabeled(
                &transformed,
                self.config.batch_size,
                self.config.shuffle,
            );
            let stats = trainer.train(
                layer.as_mut(),
                &mut batches,
                transformed.as_slice(),
                epochs,
                &mut run.rng,
            )?;
            if let Some(last) = stats.last() {
                info!(
                    layer = index,
                    reconstruction_error = last.reconstruction_error,
                    "RBM layer pretrained"
                );
            }
            history.push(stats);
        }
        Ok(history)
    }

    /// Supervised fine-tuning of the whole stack with backpropagation.
    pub fn fine_tune(
        &mut self,
        data: &Dataset,
        labels: &Labels,
        epochs: usize,
    ) -> Result<Vec<EpochStats>> {
        self.check_data(data)?;
        let mut batches =
            InMemoryBatches::labeled(data, labels, self.config.batch_size, self.config.shuffle)?;
        self.fine_tune_batches(&mut batches, epochs)
    }

    /// Train the stack to reproduce its input under the mean squared error.
    pub fn fine_tune_autoencoder(
        &mut self,
        data: &Dataset,
        epochs: usize,
    ) -> Result<Vec<EpochStats>> {
        self.check_data(data)?;
        let mut batches =
            InMemoryBatches::autoencoder(data, self.config.batch_size, self.config.shuffle);
        let config = TrainingConfig {
            loss: Loss::MeanSquaredError,
            ..self.config.clone()
        };
        self.run_sgd(&config, &mut batches, epochs)
    }

    /// Fine-tune over any batch source. Layers are back in inference mode when
    /// this returns, whether or not training succeeded.
    pub fn fine_tune_batches(
        &mut self,
        source: &mut dyn BatchSource,
        epochs: usize,
    ) -> Result<Vec<EpochStats>> {
        let config = self.config.clone();
        self.run_sgd(&config, source, epochs)
    }

    fn run_sgd(
        &mut self,
        config: &TrainingConfig,
        source: &mut dyn BatchSource,
        epochs: usize,
    ) -> Result<Vec<EpochStats>> {
        let mut trainer = SgdTrainer::new(&self.layers, config)?;
        let mut run = TrainingContext::new(&mut self.layers, config.seed);
        info!(
            layers = self.layers.len(),
            samples = source.len(),
            epochs,
            loss = ?config.loss,
            "fine-tuning network"
        );

        self.set_training(true);
        let result = trainer.train(&mut self.layers, source, epochs, &mut run.rng);
        self.set_training(false);

        let history = result?;
        if let Some(last) = history.last() {
            info!(loss = last.loss, error_rate = ?last.error_rate, "fine-tuning finished");
        }
        Ok(history)
    }

    /// Forward one sample in inference mode.
    pub fn infer(&mut self, sample: &[f32]) -> Result<Vec<f32>> {
        self.infer_batch(sample, 1)
    }

    /// Forward `batch_size` samples in inference mode.
    pub fn infer_batch(&mut self, inputs: &[f32], batch_size: usize) -> Result<Vec<f32>> {
        let expected = batch_size * self.layers[0].input_size();
        if inputs.len() != expected {
            return Err(DbnError::DataShape {
                expected,
                actual: inputs.len(),
            });
        }
        self.set_training(false);
        Ok(self.forward_range(0..self.layers.len(), inputs, batch_size))
    }

    /// Index of the largest output for `sample`; the first wins on ties.
    pub fn predict(&mut self, sample: &[f32]) -> Result<usize> {
        Ok(argmax(&self.infer(sample)?))
    }

    /// Error of the network on a labelled set: the misclassification rate for
    /// class labels, the mean squared error per output value for value targets.
    pub fn evaluate(&mut self, data: &Dataset, labels: &Labels) -> Result<f32> {
        self.check_data(data)?;
        if labels.len() != data.len() {
            return Err(DbnError::DataShape {
                expected: data.len(),
                actual: labels.len(),
            });
        }
        labels.validate()?;
        let width = self.layers[self.layers.len() - 1].output_size();
        if labels.target_len() != width {
            return Err(DbnError::DataShape {
                expected: width,
                actual: labels.target_len(),
            });
        }
        if data.is_empty() {
            return Ok(0.0);
        }

        let outputs = self.infer_batch(data.as_slice(), data.len())?;
        let error = match labels {
            Labels::Classes { labels, .. } => {
                let wrong = outputs
                    .chunks_exact(width)
                    .zip(labels)
                    .filter(|(row, &label)| argmax(row) != label)
                    .count();
                wrong as f32 / data.len() as f32
            }
            Labels::Values { values, .. } => {
                let sse: f32 = outputs.iter().zip(values).map(|(y, t)| (y - t) * (y - t)).sum();
                sse / outputs.len() as f32
            }
        };
        Ok(error)
    }

    /// Deterministic reconstruction error of the first RBM layer on `data`, as
    /// seen through the layers in front of it.
    pub fn reconstruction_error(&mut self, data: &Dataset) -> Result<f32> {
        self.check_data(data)?;
        let index = (0..self.layers.len())
            .find(|&i| is_rbm(self.layers[i].as_ref()))
            .ok_or_else(|| DbnError::Architecture("network has no RBM layer".into()))?;
        self.set_training(false);
        let visible = self.forward_range(0..index, data.as_slice(), data.len());
        let rbm = self.layers[index]
            .as_rbm_mut()
            .ok_or_else(|| DbnError::Architecture(format!("layer {} is not an RBM", index)))?;
        Ok(rbm.reconstruction_error(&visible, data.len()))
    }

    /// Write every layer's parameters to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        persistence::save(&self.layers, path)?;
        info!(path = %path.display(), parameters = self.parameter_count(), "network saved");
        Ok(())
    }

    /// Restore parameters saved from a network of the same architecture. The
    /// file is rejected wholesale on any mismatch.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        persistence::load(&mut self.layers, path)?;
        info!(path = %path.display(), "network loaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::{DenseLayer, MaxPool2DLayer, PoolConfig, RbmConfig, RbmLayer};
    use crate::utils::{Activation, SeededRng};

    fn dense_stack() -> Vec<Box<dyn Layer>> {
        let mut rng = SeededRng::new(3);
        vec![
            Box::new(DenseLayer::new(4, 3, Activation::Sigmoid, &mut rng)),
            Box::new(DenseLayer::new(3, 2, Activation::Softmax, &mut rng)),
        ]
    }

    #[test]
    fn test_empty_network_rejected() {
        assert!(matches!(
            Network::new(Vec::new(), TrainingConfig::default()),
            Err(DbnError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = TrainingConfig {
            batch_size: 0,
            ..TrainingConfig::default()
        };
        assert!(matches!(Network::new(dense_stack(), config), Err(DbnError::InvalidConfig(_))));
    }

    #[test]
    fn test_image_output_flattens_into_dense() {
        let mut rng = SeededRng::new(1);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(MaxPool2DLayer::new(PoolConfig::square(2, 4, 4, 2)).unwrap()),
            Box::new(DenseLayer::new(8, 2, Activation::Softmax, &mut rng)),
        ];
        let net = Network::new(layers, TrainingConfig::default()).unwrap();
        assert_eq!(net.output_shape(), Shape::flat(2));
    }

    #[test]
    fn test_infer_rejects_wrong_length() {
        let mut net = Network::new(dense_stack(), TrainingConfig::default()).unwrap();
        assert!(matches!(
            net.infer(&[0.0; 3]),
            Err(DbnError::DataShape { expected: 4, actual: 3 })
        ));
    }

    #[test]
    fn test_reconstruction_error_requires_rbm() {
        let mut net = Network::new(dense_stack(), TrainingConfig::default()).unwrap();
        let data = Dataset::new(Shape::flat(4), vec![0.0; 8]).unwrap();
        assert!(matches!(net.reconstruction_error(&data), Err(DbnError::Architecture(_))));
    }

    #[test]
    fn test_pretrain_skips_dense_layers() {
        let mut rng = SeededRng::new(5);
        let layers: Vec<Box<dyn Layer>> = vec![
            Box::new(RbmLayer::new(RbmConfig::new(4, 3), &mut rng).unwrap()),
            Box::new(DenseLayer::new(3, 2, Activation::Softmax, &mut rng)),
        ];
        let mut net = Network::new(layers, TrainingConfig::default()).unwrap();
        let dense_before = net.layers()[1].params()[0].value.clone();
        let data =
            Dataset::new(Shape::flat(4), vec![1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]).unwrap();

        let history = net.pretrain(&data, 3).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].len(), 3);
        assert_eq!(net.layers()[1].params()[0].value, dense_before);
    }
}
