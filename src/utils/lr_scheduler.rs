//! Learning rate schedules
//!
//! The SGD trainer steps its schedule once at the end of every epoch and hands
//! the resulting rate to the optimizer before the next epoch starts.

use crate::config::SchedulerConfig;

/// Core trait for learning rate schedulers.
///
/// # Example
///
/// ```ignore
/// let mut scheduler = StepDecay::new(0.1, 3, 0.5);
///
/// for epoch in 0..num_epochs {
///     optimizer.set_learning_rate(scheduler.get_lr());
///     // ... train one epoch ...
///     scheduler.step();
/// }
/// ```
pub trait LRScheduler: Send {
    /// Learning rate for the current epoch.
    fn get_lr(&self) -> f32;

    /// Advance to the next epoch.
    fn step(&mut self);

    /// Return to the initial learning rate.
    fn reset(&mut self);
}

/// Build the scheduler described by `config`, starting at `initial_lr`.
pub fn from_config(config: &SchedulerConfig, initial_lr: f32) -> Box<dyn LRScheduler> {
    match *config {
        SchedulerConfig::Constant => Box::new(Constant::new(initial_lr)),
        SchedulerConfig::StepDecay { step_size, gamma } => {
            Box::new(StepDecay::new(initial_lr, step_size, gamma))
        }
        SchedulerConfig::Exponential { decay_rate } => {
            Box::new(ExponentialDecay::new(initial_lr, decay_rate))
        }
    }
}

/// Keeps the learning rate fixed.
pub struct Constant {
    lr: f32,
}

impl Constant {
    pub fn new(lr: f32) -> Self {
        Self { lr }
    }
}

impl LRScheduler for Constant {
    fn get_lr(&self) -> f32 {
        self.lr
    }

    fn step(&mut self) {}

    fn reset(&mut self) {}
}

/// Step decay: `lr = initial_lr * gamma^(epoch / step_size)`.
///
/// `epoch` counts completed steps from zero, so the first `step_size` epochs
/// run at `initial_lr` and the rate drops once every `step_size` steps.
///
/// # Example
///
/// ```
/// use rust_dbn::utils::lr_scheduler::{LRScheduler, StepDecay};
///
/// let mut scheduler = StepDecay::new(0.1, 3, 0.5);
/// for _ in 0..3 {
///     scheduler.step();
/// }
/// assert!((scheduler.get_lr() - 0.05).abs() < 1e-7);
/// ```
pub struct StepDecay {
    initial_lr: f32,
    step_size: usize,
    gamma: f32,
    current_epoch: usize,
    current_lr: f32,
}

impl StepDecay {
    /// `step_size` must be positive (enforced by config validation).
    pub fn new(initial_lr: f32, step_size: usize, gamma: f32) -> Self {
        Self {
            initial_lr,
            step_size: step_size.max(1),
            gamma,
            current_epoch: 0,
            current_lr: initial_lr,
        }
    }
}

impl LRScheduler for StepDecay {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {
        self.current_epoch += 1;
        let num_decays = self.current_epoch / self.step_size;
        self.current_lr = self.initial_lr * self.gamma.powi(num_decays as i32);
    }

    fn reset(&mut self) {
        self.current_epoch = 0;
        self.current_lr = self.initial_lr;
    }
}

/// Exponential decay: `lr = initial_lr * gamma^epoch`.
pub struct ExponentialDecay {
    initial_lr: f32,
    gamma: f32,
    current_epoch: usize,
    current_lr: f32,
}

impl ExponentialDecay {
    pub fn new(initial_lr: f32, gamma: f32) -> Self {
        Self {
            initial_lr,
            gamma,
            current_epoch: 0,
            current_lr: initial_lr,
        }
    }
}

impl LRScheduler for ExponentialDecay {
    fn get_lr(&self) -> f32 {
        self.current_lr
    }

    fn step(&mut self) {
        self.current_epoch += 1;
        self.current_lr = self.initial_lr * self.gamma.powi(self.current_epoch as i32);
    }

    fn reset(&mut self) {
        self.current_epoch = 0;
        self.current_lr = self.initial_lr;
    }
}
