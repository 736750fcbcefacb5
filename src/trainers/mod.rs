//! Training algorithms
//!
//! - [`CdTrainer`]: Contrastive Divergence / Persistent CD for one RBM layer
//! - [`SgdTrainer`]: mini-batch backpropagation over a whole layer stack
//!
//! Per-layer state of a run (momentum buffers, sparsity averages, persistent
//! chains) lives in a [`LayerContext`]; the run's random stream in a
//! [`TrainingContext`].

pub mod cd;
pub mod context;
pub mod loss;
pub mod sgd;

pub use cd::{CdEpochStats, CdTrainer};
pub use context::{LayerContext, ParamState, TrainingContext};
pub use loss::Loss;
pub use sgd::{EpochStats, SgdTrainer};
