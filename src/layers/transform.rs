//! Parameter-free transform layers.
//!
//! Binarization, scaling, local contrast normalisation, rectification and
//! reshaping. None of them has trainable state; binarization and local contrast
//! normalisation are preprocessing steps without a usable gradient.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind};
use crate::shape::Shape;

/// Maps every value to 1.0 when it exceeds `threshold`, 0.0 otherwise.
pub struct BinarizeLayer {
    shape: Shape,
    threshold: f32,
}

impl BinarizeLayer {
    pub fn new(shape: Shape, threshold: f32) -> Self {
        Self { shape, threshold }
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }
}

impl Layer for BinarizeLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Binarize
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.shape.len());
        check_len("output", output, batch_size * self.shape.len());
        for (o, &x) in output.iter_mut().zip(input) {
            *o = if x > self.threshold { 1.0 } else { 0.0 };
        }
    }

    fn backward(
        &mut self,
        _input: &[f32],
        _grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_input", grad_input, batch_size * self.shape.len());
        grad_input.iter_mut().for_each(|g| *g = 0.0);
    }

    fn is_differentiable(&self) -> bool {
        false
    }
}

/// Multiplies every value by a constant factor.
pub struct ScaleLayer {
    shape: Shape,
    factor: f32,
}

impl ScaleLayer {
    pub fn new(shape: Shape, factor: f32) -> Self {
        Self { shape, factor }
    }

    pub fn factor(&self) -> f32 {
        self.factor
    }
}

impl Layer for ScaleLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Scale
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.shape.len());
        check_len("output", output, batch_size * self.shape.len());
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x * self.factor;
        }
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.shape.len());
        check_len("grad_input", grad_input, batch_size * self.shape.len());
        for (gi, &g) in grad_input.iter_mut().zip(grad_output) {
            *gi = g * self.factor;
        }
    }
}

/// Absolute-value rectification.
pub struct RectifyLayer {
    shape: Shape,
}

impl RectifyLayer {
    pub fn new(shape: Shape) -> Self {
        Self { shape }
    }
}

impl Layer for RectifyLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Rectify
    }

    fn input_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.shape.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.shape.len());
        check_len("output", output, batch_size * self.shape.len());
        for (o, &x) in output.iter_mut().zip(input) {
            *o = x.abs();
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.shape.len());
        check_len("grad_input", grad_input, batch_size * self.shape.len());
        for ((gi, &g), &x) in grad_input.iter_mut().zip(grad_output).zip(input) {
            *gi = if x > 0.0 {
                g
            } else if x < 0.0 {
                -g
            } else {
                0.0
            };
        }
    }
}

/// Reinterprets a sample under another shape with the same number of values.
pub struct ReshapeLayer {
    input: Shape,
    output: Shape,
}

impl ReshapeLayer {
    pub fn new(input: Shape, output: Shape) -> Result<Self> {
        if input.len() != output.len() {
            return Err(DbnError::InvalidConfig(format!(
                "cannot reshape {} into {}",
                input, output
            )));
        }
        Ok(Self { input, output })
    }
}

impl Layer for ReshapeLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Reshape
    }

    fn input_shape(&self) -> Shape {
        self.input.clone()
    }

    fn output_shape(&self) -> Shape {
        self.output.clone()
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.input.len());
        check_len("output", output, batch_size * self.output.len());
        output.copy_from_slice(input);
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.output.len());
        check_len("grad_input", grad_input, batch_size * self.input.len());
        grad_input.copy_from_slice(grad_output);
    }
}

/// Local contrast normalisation over each feature map.
///
/// Every value has the Gaussian-weighted mean of its `kernel_size`² neighbourhood
/// subtracted, then is divided by `max(mean σ of the map, local σ)` where the
/// local σ is the Gaussian-weighted norm of the centred neighbourhood. Borders
/// are zero padded.
pub struct LcnLayer {
    channels: usize,
    height: usize,
    width: usize,
    kernel_size: usize,
    sigma: f32,
    window: Vec<f32>,
}

impl LcnLayer {
    /// `kernel_size` must be odd.
    pub fn new(
        channels: usize,
        height: usize,
        width: usize,
        kernel_size: usize,
        sigma: f32,
    ) -> Result<Self> {
        if kernel_size % 2 == 0 {
            return Err(DbnError::InvalidConfig("LCN kernel size must be odd".into()));
        }
        if sigma <= 0.0 {
            return Err(DbnError::InvalidConfig("LCN sigma must be positive".into()));
        }

        let mid = (kernel_size / 2) as f32;
        let mut window: Vec<f32> = (0..kernel_size * kernel_size)
            .map(|i| {
                let dy = (i / kernel_size) as f32 - mid;
                let dx = (i % kernel_size) as f32 - mid;
                (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp()
            })
            .collect();
        let total: f32 = window.iter().sum();
        window.iter_mut().for_each(|w| *w /= total);

        Ok(Self {
            channels,
            height,
            width,
            kernel_size,
            sigma,
            window,
        })
    }

    pub fn sigma(&self) -> f32 {
        self.sigma
    }

    /// Gaussian-weighted sum of `f(map[y', x'])` around (y, x), zero padded.
    fn weighted(&self, map: &[f32], y: usize, x: usize, f: impl Fn(f32) -> f32) -> f32 {
        let half = self.kernel_size / 2;
        let mut acc = 0.0f32;
        for p in 0..self.kernel_size {
            let Some(yy) = (y + p).checked_sub(half).filter(|&v| v < self.height) else {
                continue;
            };
            for q in 0..self.kernel_size {
                let Some(xx) = (x + q).checked_sub(half).filter(|&v| v < self.width) else {
                    continue;
                };
                acc += self.window[p * self.kernel_size + q] * f(map[yy * self.width + xx]);
            }
        }
        acc
    }

    fn normalize_map(&self, map: &[f32], out: &mut [f32]) {
        let spatial = self.height * self.width;
        let mut centred = vec![0.0f32; spatial];
        for y in 0..self.height {
            for x in 0..self.width {
                let i = y * self.width + x;
                centred[i] = map[i] - self.weighted(map, y, x, |v| v);
            }
        }

        let mut local_sigma = vec![0.0f32; spatial];
        for y in 0..self.height {
            for x in 0..self.width {
                local_sigma[y * self.width + x] = self.weighted(&centred, y, x, |v| v * v).sqrt();
            }
        }
        let mean_sigma = local_sigma.iter().sum::<f32>() / spatial.max(1) as f32;

        for ((o, &v), &s) in out.iter_mut().zip(&centred).zip(&local_sigma) {
            let divisor = mean_sigma.max(s);
            *o = if divisor > 0.0 { v / divisor } else { v };
        }
    }
}

impl Layer for LcnLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Lcn
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.channels, self.height, self.width)
    }

    fn output_shape(&self) -> Shape {
        Shape::image(self.channels, self.height, self.width)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let spatial = self.height * self.width;
        check_len("input", input, batch_size * self.channels * spatial);
        check_len("output", output, batch_size * self.channels * spatial);
        if spatial == 0 {
            return;
        }
        for (map, out) in input.chunks_exact(spatial).zip(output.chunks_exact_mut(spatial)) {
            self.normalize_map(map, out);
        }
    }

    fn backward(
        &mut self,
        _input: &[f32],
        _grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_input", grad_input, batch_size * self.input_size());
        grad_input.iter_mut().for_each(|g| *g = 0.0);
    }

    fn is_differentiable(&self) -> bool {
        false
    }
}
