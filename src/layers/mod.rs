//! Layer abstractions
//!
//! This module provides the Layer trait and the closed catalogue of layer kinds
//! a network is assembled from.

mod r#trait;
pub mod activation;
pub mod batchnorm;
pub mod composite;
pub mod conv2d;
pub mod deconv2d;
pub mod dense;
pub mod dropout;
pub mod embedding;
pub mod pooling;
pub mod rbm;
pub mod recurrent;
pub mod transform;

// Re-export the Layer trait for convenience
pub use r#trait::{Layer, LayerKind, Param};

pub use activation::ActivationLayer;
pub use batchnorm::BatchNormLayer;
pub use composite::{GroupLayer, MergeLayer};
pub use conv2d::{Conv2DLayer, ConvConfig, Padding};
pub use deconv2d::Deconv2DLayer;
pub use dense::DenseLayer;
pub use dropout::DropoutLayer;
pub use embedding::EmbeddingLayer;
pub use pooling::{AvgPool2DLayer, MaxPool2DLayer, PoolConfig, Upsample2DLayer};
pub use rbm::{ConvRbmConfig, ConvRbmLayer, HiddenUnit, Rbm, RbmConfig, RbmLayer, VisibleUnit};
pub use recurrent::{LastStepLayer, LstmLayer, RnnLayer};
pub use transform::{BinarizeLayer, LcnLayer, RectifyLayer, ReshapeLayer, ScaleLayer};
