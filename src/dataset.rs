//! Training data collaborators
//!
//! In-memory sample collections, their labels, and the [`BatchSource`]
//! abstraction the trainers consume one epoch at a time. Batches can be
//! assembled on a producer thread while the previous one trains (double
//! buffering); the trainer still commits each update before the next batch's
//! forward pass starts.

use crate::error::{DbnError, Result};
use crate::shape::Shape;
use crate::utils::SeededRng;
use crossbeam_channel::bounded;
use std::thread;

/// Fixed-shape samples stored contiguously.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    shape: Shape,
    samples: Vec<f32>,
}

impl Dataset {
    /// `samples` holds `n × shape.len()` values.
    pub fn new(shape: Shape, samples: Vec<f32>) -> Result<Self> {
        let sample_len = shape.len();
        if sample_len == 0 {
            return Err(DbnError::InvalidConfig("dataset samples must not be empty".into()));
        }
        if samples.len() % sample_len != 0 {
            return Err(DbnError::DataShape {
                expected: sample_len,
                actual: samples.len() % sample_len,
            });
        }
        Ok(Self { shape, samples })
    }

    /// Build from one vector per sample; every vector must match `shape`.
    pub fn from_samples(shape: Shape, samples: &[Vec<f32>]) -> Result<Self> {
        let sample_len = shape.len();
        let mut flat = Vec::with_capacity(samples.len() * sample_len);
        for sample in samples {
            if sample.len() != sample_len {
                return Err(DbnError::DataShape {
                    expected: sample_len,
                    actual: sample.len(),
                });
            }
            flat.extend_from_slice(sample);
        }
        Self::new(shape, flat)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn sample_len(&self) -> usize {
        self.shape.len()
    }

    /// Number of samples.
    pub fn len(&self) -> usize {
        self.samples.len() / self.sample_len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample(&self, index: usize) -> &[f32] {
        let n = self.sample_len();
        &self.samples[index * n..(index + 1) * n]
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.samples
    }

    /// Concatenate the samples at `indices`.
    pub fn gather(&self, indices: &[usize]) -> Vec<f32> {
        let mut out = Vec::with_capacity(indices.len() * self.sample_len());
        for &i in indices {
            out.extend_from_slice(self.sample(i));
        }
        out
    }
}

/// Supervision paired 1:1 with the samples of a [`Dataset`].
#[derive(Debug, Clone, PartialEq)]
pub enum Labels {
    /// Class indices, turned into one-hot targets of `classes` values.
    Classes { classes: usize, labels: Vec<usize> },
    /// Regression targets of `width` values per sample.
    Values { width: usize, values: Vec<f32> },
}

impl Labels {
    pub fn classes(classes: usize, labels: Vec<usize>) -> Self {
        Labels::Classes { classes, labels }
    }

    pub fn values(width: usize, values: Vec<f32>) -> Result<Self> {
        if width == 0 || values.len() % width != 0 {
            return Err(DbnError::DataShape {
                expected: width,
                actual: values.len(),
            });
        }
        Ok(Labels::Values { width, values })
    }

    /// Number of labelled samples.
    pub fn len(&self) -> usize {
        match self {
            Labels::Classes { labels, .. } => labels.len(),
            Labels::Values { width, values } => values.len() / width,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Values per target vector.
    pub fn target_len(&self) -> usize {
        match self {
            Labels::Classes { classes, .. } => *classes,
            Labels::Values { width, .. } => *width,
        }
    }

    /// Reject out-of-range class labels.
    pub fn validate(&self) -> Result<()> {
        if let Labels::Classes { classes, labels } = self {
            if let Some((index, &label)) = labels.iter().enumerate().find(|(_, &l)| l >= *classes) {
                return Err(DbnError::InvalidLabel {
                    index,
                    label,
                    classes: *classes,
                });
            }
        }
        Ok(())
    }

    /// Append the target vectors of `indices` to `out`.
    pub fn extend_targets(&self, indices: &[usize], out: &mut Vec<f32>) {
        match self {
            Labels::Classes { classes, labels } => {
                for &i in indices {
                    let start = out.len();
                    out.resize(start + classes, 0.0);
                    out[start + labels[i]] = 1.0;
                }
            }
            Labels::Values { width, values } => {
                for &i in indices {
                    out.extend_from_slice(&values[i * width..(i + 1) * width]);
                }
            }
        }
    }
}

/// One mini-batch of samples and (possibly empty) flat targets.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub targets: Vec<f32>,
    /// Class labels when the targets are one-hot classes.
    pub classes: Option<Vec<usize>>,
    pub size: usize,
}

/// A restartable, finite sequence of batches (one pass per epoch).
pub trait BatchSource: Send {
    /// Values per input sample.
    fn sample_len(&self) -> usize;

    /// Values per target vector, 0 when unlabelled.
    fn target_len(&self) -> usize;

    /// Number of samples in one epoch.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Start a new epoch, reshuffling when the source was built to.
    fn reset(&mut self, rng: &mut SeededRng);

    fn next_batch(&mut self) -> Option<Batch>;
}

/// What the targets of an [`InMemoryBatches`] are.
#[derive(Debug, Clone, Copy)]
enum Targets<'a> {
    None,
    Labels(&'a Labels),
    /// The inputs themselves (autoencoders).
    Inputs,
}

/// Batches drawn without replacement from an in-memory [`Dataset`].
pub struct InMemoryBatches<'a> {
    data: &'a Dataset,
    targets: Targets<'a>,
    batch_size: usize,
    shuffle: bool,
    order: Vec<usize>,
    cursor: usize,
}

impl<'a> InMemoryBatches<'a> {
    /// Unlabelled batches (pretraining, inference).
    pub fn unlabeled(data: &'a Dataset, batch_size: usize, shuffle: bool) -> Self {
        Self {
            data,
            targets: Targets::None,
            batch_size: batch_size.max(1),
            shuffle,
            order: (0..data.len()).collect(),
            cursor: 0,
        }
    }

    /// Labelled batches; labels must pair 1:1 with the samples.
    pub fn labeled(
        data: &'a Dataset,
        labels: &'a Labels,
        batch_size: usize,
        shuffle: bool,
    ) -> Result<Self> {
        if labels.len() != data.len() {
            return Err(DbnError::DataShape {
                expected: data.len(),
                actual: labels.len(),
            });
        }
        labels.validate()?;
        let mut batches = Self::unlabeled(data, batch_size, shuffle);
        batches.targets = Targets::Labels(labels);
        Ok(batches)
    }

    /// Batches whose targets are their own inputs.
    pub fn autoencoder(data: &'a Dataset, batch_size: usize, shuffle: bool) -> Self {
        let mut batches = Self::unlabeled(data, batch_size, shuffle);
        batches.targets = Targets::Inputs;
        batches
    }
}

impl BatchSource for InMemoryBatches<'_> {
    fn sample_len(&self) -> usize {
        self.data.sample_len()
    }

    fn target_len(&self) -> usize {
        match self.targets {
            Targets::None => 0,
            Targets::Labels(labels) => labels.target_len(),
            Targets::Inputs => self.data.sample_len(),
        }
    }

    fn len(&self) -> usize {
        self.data.len()
    }

    fn reset(&mut self, rng: &mut SeededRng) {
        self.order = (0..self.data.len()).collect();
        if self.shuffle {
            rng.shuffle_usize(&mut self.order);
        }
        self.cursor = 0;
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;

        let inputs = self.data.gather(indices);
        let mut targets = Vec::new();
        let mut classes = None;
        match self.targets {
            Targets::None => {}
            Targets::Labels(labels) => {
                labels.extend_targets(indices, &mut targets);
                if let Labels::Classes { labels, .. } = labels {
                    classes = Some(indices.iter().map(|&i| labels[i]).collect());
                }
            }
            Targets::Inputs => targets.extend_from_slice(&inputs),
        }

        Some(Batch {
            inputs,
            targets,
            classes,
            size: indices.len(),
        })
    }
}

/// Run `step` on every remaining batch of `source`.
///
/// With `double_buffer`, a scoped producer thread assembles the next batch
/// while `step` runs; the channel holds at most one finished batch. An error
/// from `step` stops the epoch and the producer.
pub fn for_each_batch<F>(
    source: &mut dyn BatchSource,
    double_buffer: bool,
    mut step: F,
) -> Result<()>
where
    F: FnMut(Batch) -> Result<()>,
{
    if !double_buffer {
        while let Some(batch) = source.next_batch() {
            step(batch)?;
        }
        return Ok(());
    }

    let (sender, receiver) = bounded::<Batch>(1);
    thread::scope(|scope| {
        scope.spawn(move || {
            while let Some(batch) = source.next_batch() {
                if sender.send(batch).is_err() {
                    break;
                }
            }
        });

        // Owned here so an early return disconnects the producer before the join
        let receiver = receiver;
        for batch in receiver.iter() {
            step(batch)?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Dataset {
        Dataset::new(Shape::flat(2), (0..10).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_dataset_rejects_partial_sample() {
        assert!(Dataset::new(Shape::flat(3), vec![0.0; 7]).is_err());
        assert_eq!(dataset().len(), 5);
    }

    #[test]
    fn test_batches_cover_epoch_with_short_final_batch() {
        let data = dataset();
        let mut source = InMemoryBatches::unlabeled(&data, 2, true);
        source.reset(&mut SeededRng::new(1));

        let mut sizes = Vec::new();
        let mut seen = Vec::new();
        for_each_batch(&mut source, false, |batch| {
            sizes.push(batch.size);
            seen.extend(batch.inputs.chunks(2).map(|s| s[0] as usize / 2));
            Ok(())
        })
        .unwrap();

        assert_eq!(sizes, vec![2, 2, 1]);
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_double_buffer_yields_same_batches() {
        let data = dataset();
        let labels = Labels::classes(3, vec![0, 1, 2, 0, 1]);

        let collect = |double_buffer: bool| {
            let mut source = InMemoryBatches::labeled(&data, &labels, 2, true).unwrap();
            source.reset(&mut SeededRng::new(7));
            let mut batches = Vec::new();
            for_each_batch(&mut source, double_buffer, |batch| {
                batches.push(batch);
                Ok(())
            })
            .unwrap();
            batches
        };
        assert_eq!(collect(false), collect(true));
    }

    #[test]
    fn test_double_buffer_stops_on_error() {
        let data = dataset();
        let mut source = InMemoryBatches::unlabeled(&data, 1, false);
        source.reset(&mut SeededRng::new(1));
        let mut calls = 0;
        let result = for_each_batch(&mut source, true, |_| {
            calls += 1;
            Err(DbnError::InvalidConfig("stop".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_invalid_class_label_rejected() {
        let data = dataset();
        let labels = Labels::classes(2, vec![0, 1, 2, 0, 1]);
        assert!(matches!(
            InMemoryBatches::labeled(&data, &labels, 2, false),
            Err(DbnError::InvalidLabel { index: 2, label: 2, classes: 2 })
        ));
    }

    #[test]
    fn test_one_hot_targets() {
        let labels = Labels::classes(3, vec![2, 0]);
        let mut out = Vec::new();
        labels.extend_targets(&[0, 1], &mut out);
        assert_eq!(out, vec![0.0, 0.0, 1.0, 1.0, 0.0, 0.0]);
    }
}
