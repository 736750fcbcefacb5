//! Shared utilities for layer and trainer implementations
//!
//! This module provides random number generation, activation functions,
//! the data-parallel numeric kernels and learning-rate schedules.

pub mod activations;
pub mod kernels;
pub mod lr_scheduler;
pub mod rng;

pub use activations::Activation;
pub use rng::SeededRng;
