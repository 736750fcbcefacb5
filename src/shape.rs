//! Runtime shape descriptors.
//!
//! Every layer declares the shape of one sample on its input and output side.
//! Shapes are plain dimension lists stored outermost first (`[c, h, w]` for
//! images, `[t, d]` for sequences, `[n]` for flat vectors).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Shape of a single sample (the batch dimension is never part of it).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape(Vec<usize>);

impl Shape {
    /// Create a shape from its dimensions.
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Self(dims.into())
    }

    /// Flat vector of `n` values.
    pub fn flat(n: usize) -> Self {
        Self(vec![n])
    }

    /// Image with `channels` feature maps of `height` × `width`.
    pub fn image(channels: usize, height: usize, width: usize) -> Self {
        Self(vec![channels, height, width])
    }

    /// Sequence of `steps` vectors of `features` values.
    pub fn sequence(steps: usize, features: usize) -> Self {
        Self(vec![steps, features])
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Number of scalar values in one sample.
    pub fn len(&self) -> usize {
        self.0.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a layer declaring `self` as input accepts samples of shape `producer`.
    ///
    /// Shapes must be equal, except that a rank-1 consumer accepts any producer
    /// with the same number of values (implicit flattening).
    pub fn accepts(&self, producer: &Shape) -> bool {
        self == producer || (self.rank() == 1 && self.len() == producer.len())
    }

    /// Interpret the shape as `[c, h, w]`; flat shapes are `[n, 1, 1]`.
    pub fn as_image(&self) -> Option<(usize, usize, usize)> {
        match self.0.as_slice() {
            [c, h, w] => Some((*c, *h, *w)),
            [n] => Some((*n, 1, 1)),
            _ => None,
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.0.iter().map(|d| d.to_string()).collect();
        write!(f, "[{}]", dims.join("x"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shape_len_and_display() {
        let shape = Shape::image(3, 28, 28);
        assert_eq!(shape.len(), 3 * 28 * 28);
        assert_eq!(shape.rank(), 3);
        assert_eq!(shape.to_string(), "[3x28x28]");
    }

    #[test]
    fn test_flat_consumer_accepts_same_length() {
        let conv_out = Shape::image(4, 5, 5);
        assert!(Shape::flat(100).accepts(&conv_out));
        assert!(!Shape::flat(99).accepts(&conv_out));
        assert!(!Shape::image(4, 25, 1).accepts(&conv_out));
    }
}
