//! Configuration structures for training
//!
//! This module provides the global hyperparameters the network hands to its
//! trainers: update rule, regularisation, batching, learning-rate schedule,
//! Contrastive Divergence settings and sparsity targets.
//!
//! # Example
//!
//! ```json
//! {
//!   "learning_rate": 0.1,
//!   "momentum": 0.9,
//!   "weight_decay": { "type": "l2", "cost": 0.0002 },
//!   "batch_size": 20,
//!   "scheduler": { "scheduler_type": "step_decay", "step_size": 5, "gamma": 0.5 },
//!   "cd": { "k": 1, "persistent": true, "chains": 10 },
//!   "sparsity": { "target": 0.05, "cost": 0.5, "decay": 0.9 }
//! }
//! ```

use crate::error::{DbnError, Result};
use crate::optimizers::WeightDecay;
use crate::trainers::Loss;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Learning-rate schedule applied once per fine-tuning epoch.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "scheduler_type", rename_all = "snake_case")]
pub enum SchedulerConfig {
    #[default]
    Constant,
    StepDecay { step_size: usize, gamma: f32 },
    Exponential { decay_rate: f32 },
}

/// Parameter update rule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    /// Momentum SGD using `TrainingConfig::momentum`.
    #[default]
    Sgd,
    Adam {
        #[serde(default = "default_beta1")]
        beta1: f32,
        #[serde(default = "default_beta2")]
        beta2: f32,
        #[serde(default = "default_adam_epsilon")]
        epsilon: f32,
    },
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_adam_epsilon() -> f32 {
    1e-8
}

/// Contrastive Divergence settings for RBM pretraining.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CdConfig {
    /// Number of Gibbs steps in the negative phase (CD-k).
    pub k: usize,
    /// Keep the Markov chains between mini-batches (PCD).
    pub persistent: bool,
    /// Number of persistent chains; defaults to the batch size.
    pub chains: Option<usize>,
    /// Learning rate override for pretraining.
    pub learning_rate: Option<f32>,
    /// Momentum override for pretraining.
    pub momentum: Option<f32>,
    /// Initialise visible biases from the data before training.
    pub init_visible_biases: bool,
}

impl Default for CdConfig {
    fn default() -> Self {
        Self {
            k: 1,
            persistent: false,
            chains: None,
            learning_rate: None,
            momentum: None,
            init_visible_biases: true,
        }
    }
}

/// Sparsity regularisation of RBM hidden units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SparsityConfig {
    /// Target mean activation of each hidden unit.
    pub target: f32,
    /// Strength of the penalty added to the hidden-bias gradient.
    #[serde(default = "default_sparsity_cost")]
    pub cost: f32,
    /// Decay of the running average of hidden activations.
    #[serde(default = "default_sparsity_decay")]
    pub decay: f32,
}

fn default_sparsity_cost() -> f32 {
    1.0
}

fn default_sparsity_decay() -> f32 {
    0.9
}

/// Global hyperparameters shared by the CD and SGD trainers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub learning_rate: f32,
    pub momentum: f32,
    pub weight_decay: WeightDecay,
    pub batch_size: usize,
    pub optimizer: OptimizerConfig,
    pub loss: Loss,
    pub scheduler: SchedulerConfig,
    pub cd: CdConfig,
    pub sparsity: Option<SparsityConfig>,
    /// Reshuffle the sample order every epoch.
    pub shuffle: bool,
    /// Assemble the next batch on a producer thread while the current one trains.
    pub double_buffer: bool,
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            momentum: 0.5,
            weight_decay: WeightDecay::None,
            batch_size: 32,
            optimizer: OptimizerConfig::Sgd,
            loss: Loss::CrossEntropy,
            scheduler: SchedulerConfig::Constant,
            cd: CdConfig::default(),
            sparsity: None,
            shuffle: true,
            double_buffer: false,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// Learning rate used by the CD trainer.
    pub fn cd_learning_rate(&self) -> f32 {
        self.cd.learning_rate.unwrap_or(self.learning_rate)
    }

    /// Momentum used by the CD trainer.
    pub fn cd_momentum(&self) -> f32 {
        self.cd.momentum.unwrap_or(self.momentum)
    }
}

/// Loads a training configuration from a JSON file and validates it.
///
/// # Examples
///
/// ```no_run
/// use rust_dbn::config::load_config;
///
/// let cfg = load_config("config/dbn_mnist.json").unwrap();
/// assert!(cfg.batch_size > 0);
/// ```
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let contents = fs::read_to_string(path)?;
    let config: TrainingConfig = serde_json::from_str(&contents)?;
    validate_config(&config)?;
    Ok(config)
}

fn invalid(message: impl Into<String>) -> DbnError {
    DbnError::InvalidConfig(message.into())
}

/// Check every hyperparameter range. Called by `load_config` and by the
/// network before any training starts.
pub fn validate_config(config: &TrainingConfig) -> Result<()> {
    let rates = [
        ("learning_rate", Some(config.learning_rate)),
        ("cd.learning_rate", config.cd.learning_rate),
    ];
    for (name, rate) in rates {
        if let Some(rate) = rate {
            if !(rate > 0.0 && rate.is_finite()) {
                return Err(invalid(format!("{name} must be positive and finite")));
            }
        }
    }

    for (name, momentum) in [
        ("momentum", Some(config.momentum)),
        ("cd.momentum", config.cd.momentum),
    ] {
        if let Some(momentum) = momentum {
            if !(0.0..1.0).contains(&momentum) {
                return Err(invalid(format!("{name} must be in range [0.0, 1.0)")));
            }
        }
    }

    if config.batch_size == 0 {
        return Err(invalid("batch_size must be greater than 0"));
    }

    match config.weight_decay {
        WeightDecay::L1 { cost } | WeightDecay::L2 { cost } if cost < 0.0 => {
            return Err(invalid("weight decay cost must be non-negative"));
        }
        WeightDecay::L1L2 { l1, l2 } if l1 < 0.0 || l2 < 0.0 => {
            return Err(invalid("weight decay costs must be non-negative"));
        }
        _ => {}
    }

    if let OptimizerConfig::Adam { beta1, beta2, epsilon } = config.optimizer {
        if !(0.0..1.0).contains(&beta1) || !(0.0..1.0).contains(&beta2) {
            return Err(invalid("adam betas must be in range [0.0, 1.0)"));
        }
        if epsilon <= 0.0 {
            return Err(invalid("adam epsilon must be positive"));
        }
    }

    match config.scheduler {
        SchedulerConfig::StepDecay { step_size, gamma } => {
            if step_size == 0 {
                return Err(invalid("step_size must be greater than 0"));
            }
            if gamma < 0.0 {
                return Err(invalid("gamma must be non-negative"));
            }
        }
        SchedulerConfig::Exponential { decay_rate } if decay_rate < 0.0 => {
            return Err(invalid("decay_rate must be non-negative"));
        }
        _ => {}
    }

    if config.cd.k == 0 {
        return Err(invalid("cd.k must be at least 1"));
    }
    if config.cd.chains == Some(0) {
        return Err(invalid("cd.chains must be at least 1"));
    }

    if let Some(sparsity) = config.sparsity {
        if !(sparsity.target > 0.0 && sparsity.target < 1.0) {
            return Err(invalid("sparsity.target must be in range (0.0, 1.0)"));
        }
        if sparsity.cost < 0.0 {
            return Err(invalid("sparsity.cost must be non-negative"));
        }
        if !(0.0..1.0).contains(&sparsity.decay) {
            return Err(invalid("sparsity.decay must be in range [0.0, 1.0)"));
        }
    }

    Ok(())
}
