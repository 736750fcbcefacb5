//! Layered statistical model engine
//!
//! This library trains Restricted Boltzmann Machines, stacks of RBMs (Deep Belief
//! Networks) and feed-forward / convolutional / recurrent layer stacks trained by
//! mini-batch backpropagation.
//!
//! # Modules
//!
//! - `layers`: Layer trait and the layer catalogue (Dense, Conv2D, pooling, RBMs, ...)
//! - `network`: The DBN container (shape checking, pretraining, fine-tuning, inference)
//! - `trainers`: Contrastive Divergence and SGD trainers plus their training context
//! - `optimizers`: Parameter update rules (momentum SGD, Adam) and weight decay
//! - `dataset`: In-memory samples, labels and batch sources
//! - `persistence`: Versioned save/load of network parameters
//! - `config`: Training configuration structures
//! - `utils`: Shared utilities (RNG, activations, kernels, LR schedules)

pub mod config;
pub mod dataset;
pub mod error;
pub mod layers;
pub mod network;
pub mod optimizers;
pub mod persistence;
pub mod shape;
pub mod trainers;
pub mod utils;

pub use error::{DbnError, Result};
pub use network::Network;
pub use shape::Shape;
