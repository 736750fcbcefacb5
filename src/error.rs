//! Error types shared by every component of the engine.

use crate::shape::Shape;

/// Errors surfaced by construction, training and persistence.
///
/// Numeric divergence (`NaN`/`Inf`) has no variant: it propagates into
/// the parameters and is left to an external monitor.
#[derive(Debug, thiserror::Error)]
pub enum DbnError {
    #[error("layer {index} output {output} does not match layer {} input {input}", index + 1)]
    ShapeMismatch {
        index: usize,
        output: Shape,
        input: Shape,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unsupported unit combination: {0}")]
    UnsupportedUnits(String),

    #[error("data shape mismatch: expected {expected} values, got {actual}")]
    DataShape { expected: usize, actual: usize },

    #[error("label {label} at sample {index} is out of range for {classes} classes")]
    InvalidLabel {
        index: usize,
        label: usize,
        classes: usize,
    },

    #[error("unsupported model file version {found} (expected {expected})")]
    Version { expected: u32, found: u32 },

    #[error("model file does not match the network architecture: {0}")]
    Architecture(String),

    #[error("cannot persist non-finite value in {0}")]
    NonFinite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, DbnError>;
