//! Pooling layers
//!
//! Max and average pooling over fixed windows of `[channels, height, width]`
//! inputs, plus nearest-neighbour upsampling as the inverse operation.
//!
//! Max pooling routes the whole gradient of a window to the position selected in
//! the forward pass. Ties are broken by the first maximum met in a row-major scan
//! of the window.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind};
use crate::shape::Shape;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Window and stride of a pooling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub channels: usize,
    pub input_height: usize,
    pub input_width: usize,
    pub pool_height: usize,
    pub pool_width: usize,
    pub stride_height: usize,
    pub stride_width: usize,
}

impl PoolConfig {
    /// Non-overlapping square windows (stride equals the window).
    pub fn square(channels: usize, input_height: usize, input_width: usize, pool: usize) -> Self {
        Self {
            channels,
            input_height,
            input_width,
            pool_height: pool,
            pool_width: pool,
            stride_height: pool,
            stride_width: pool,
        }
    }

    pub fn with_stride(mut self, stride: usize) -> Self {
        self.stride_height = stride;
        self.stride_width = stride;
        self
    }

    fn validate(&self) -> Result<(usize, usize)> {
        if self.pool_height == 0
            || self.pool_width == 0
            || self.stride_height == 0
            || self.stride_width == 0
        {
            return Err(DbnError::InvalidConfig(
                "pooling window and stride must be positive".into(),
            ));
        }
        if self.pool_height > self.input_height || self.pool_width > self.input_width {
            return Err(DbnError::InvalidConfig(format!(
                "pooling window {}x{} larger than input {}x{}",
                self.pool_height, self.pool_width, self.input_height, self.input_width
            )));
        }
        Ok((
            (self.input_height - self.pool_height) / self.stride_height + 1,
            (self.input_width - self.pool_width) / self.stride_width + 1,
        ))
    }

    fn input_len(&self) -> usize {
        self.channels * self.input_height * self.input_width
    }
}

/// Max pooling layer.
///
/// # Example
///
/// ```
/// use rust_dbn::layers::{Layer, MaxPool2DLayer, PoolConfig};
///
/// let layer = MaxPool2DLayer::new(PoolConfig::square(8, 24, 24, 2)).unwrap();
/// assert_eq!(layer.output_shape().dims(), &[8, 12, 12]);
/// ```
pub struct MaxPool2DLayer {
    config: PoolConfig,
    out_height: usize,
    out_width: usize,
    /// Index (within the sample) of the input selected for every output.
    argmax: Vec<usize>,
}

impl MaxPool2DLayer {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let (out_height, out_width) = config.validate()?;
        Ok(Self {
            config,
            out_height,
            out_width,
            argmax: Vec::new(),
        })
    }

    fn output_len(&self) -> usize {
        self.config.channels * self.out_height * self.out_width
    }
}

impl Layer for MaxPool2DLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::MaxPool2D
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.config.channels, self.config.input_height, self.config.input_width)
    }

    fn output_shape(&self) -> Shape {
        Shape::image(self.config.channels, self.out_height, self.out_width)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let cfg = self.config;
        let (in_len, out_len) = (cfg.input_len(), self.output_len());
        check_len("input", input, batch_size * in_len);
        check_len("output", output, batch_size * out_len);
        if out_len == 0 {
            return;
        }

        let (oh, ow) = (self.out_height, self.out_width);
        self.argmax.resize(batch_size * out_len, 0);
        output
            .par_chunks_mut(out_len)
            .zip(self.argmax.par_chunks_mut(out_len))
            .zip(input.par_chunks(in_len))
            .for_each(|((out, arg), inp)| {
                for c in 0..cfg.channels {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let x0 = ox * cfg.stride_width;
                            let y0 = oy * cfg.stride_height;
                            let mut best_idx = (c * cfg.input_height + y0) * cfg.input_width + x0;
                            let mut best = inp[best_idx];
                            for p in 0..cfg.pool_height {
                                let y = y0 + p;
                                for q in 0..cfg.pool_width {
                                    let idx = (c * cfg.input_height + y) * cfg.input_width + x0 + q;
                                    if inp[idx] > best {
                                        best = inp[idx];
                                        best_idx = idx;
                                    }
                                }
                            }
                            let o = (c * oh + oy) * ow + ox;
                            out[o] = best;
                            arg[o] = best_idx;
                        }
                    }
                }
            });
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let (in_len, out_len) = (self.config.input_len(), self.output_len());
        check_len("grad_output", grad_output, batch_size * out_len);
        check_len("grad_input", grad_input, batch_size * in_len);
        assert_eq!(
            self.argmax.len(),
            batch_size * out_len,
            "backward called without a matching forward pass"
        );
        if in_len == 0 || out_len == 0 {
            return;
        }

        grad_input
            .par_chunks_mut(in_len)
            .zip(grad_output.par_chunks(out_len))
            .zip(self.argmax.par_chunks(out_len))
            .for_each(|((gin, gout), arg)| {
                gin.iter_mut().for_each(|v| *v = 0.0);
                for (&g, &idx) in gout.iter().zip(arg) {
                    gin[idx] += g;
                }
            });
    }
}

/// Average pooling layer.
pub struct AvgPool2DLayer {
    config: PoolConfig,
    out_height: usize,
    out_width: usize,
}

impl AvgPool2DLayer {
    pub fn new(config: PoolConfig) -> Result<Self> {
        let (out_height, out_width) = config.validate()?;
        Ok(Self {
            config,
            out_height,
            out_width,
        })
    }

    fn output_len(&self) -> usize {
        self.config.channels * self.out_height * self.out_width
    }
}

impl Layer for AvgPool2DLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::AvgPool2D
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.config.channels, self.config.input_height, self.config.input_width)
    }

    fn output_shape(&self) -> Shape {
        Shape::image(self.config.channels, self.out_height, self.out_width)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let cfg = self.config;
        let (in_len, out_len) = (cfg.input_len(), self.output_len());
        check_len("input", input, batch_size * in_len);
        check_len("output", output, batch_size * out_len);
        if out_len == 0 {
            return;
        }

        let (oh, ow) = (self.out_height, self.out_width);
        let scale = 1.0 / (cfg.pool_height * cfg.pool_width) as f32;
        output
            .par_chunks_mut(out_len)
            .zip(input.par_chunks(in_len))
            .for_each(|(out, inp)| {
                for c in 0..cfg.channels {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let x0 = ox * cfg.stride_width;
                            let mut sum = 0.0f32;
                            for p in 0..cfg.pool_height {
                                let y = oy * cfg.stride_height + p;
                                let row = (c * cfg.input_height + y) * cfg.input_width + x0;
                                sum += inp[row..row + cfg.pool_width].iter().sum::<f32>();
                            }
                            out[(c * oh + oy) * ow + ox] = sum * scale;
                        }
                    }
                }
            });
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let cfg = self.config;
        let (in_len, out_len) = (cfg.input_len(), self.output_len());
        check_len("grad_output", grad_output, batch_size * out_len);
        check_len("grad_input", grad_input, batch_size * in_len);
        if in_len == 0 || out_len == 0 {
            return;
        }

        let (oh, ow) = (self.out_height, self.out_width);
        let scale = 1.0 / (cfg.pool_height * cfg.pool_width) as f32;
        grad_input
            .par_chunks_mut(in_len)
            .zip(grad_output.par_chunks(out_len))
            .for_each(|(gin, gout)| {
                gin.iter_mut().for_each(|v| *v = 0.0);
                for c in 0..cfg.channels {
                    for oy in 0..oh {
                        for ox in 0..ow {
                            let x0 = ox * cfg.stride_width;
                            let g = gout[(c * oh + oy) * ow + ox] * scale;
                            for p in 0..cfg.pool_height {
                                let y = oy * cfg.stride_height + p;
                                let row = (c * cfg.input_height + y) * cfg.input_width + x0;
                                gin[row..row + cfg.pool_width].iter_mut().for_each(|v| *v += g);
                            }
                        }
                    }
                }
            });
    }
}

/// Nearest-neighbour upsampling, the inverse of non-overlapping pooling.
pub struct Upsample2DLayer {
    channels: usize,
    input_height: usize,
    input_width: usize,
    factor_height: usize,
    factor_width: usize,
}

impl Upsample2DLayer {
    pub fn new(
        channels: usize,
        input_height: usize,
        input_width: usize,
        factor: usize,
    ) -> Result<Self> {
        if factor == 0 {
            return Err(DbnError::InvalidConfig("upsampling factor must be positive".into()));
        }
        Ok(Self {
            channels,
            input_height,
            input_width,
            factor_height: factor,
            factor_width: factor,
        })
    }

    fn out_dims(&self) -> (usize, usize) {
        (self.input_height * self.factor_height, self.input_width * self.factor_width)
    }
}

impl Layer for Upsample2DLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Upsample2D
    }

    fn input_shape(&self) -> Shape {
        Shape::image(self.channels, self.input_height, self.input_width)
    }

    fn output_shape(&self) -> Shape {
        let (oh, ow) = self.out_dims();
        Shape::image(self.channels, oh, ow)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let (oh, ow) = self.out_dims();
        let in_len = self.channels * self.input_height * self.input_width;
        let out_len = self.channels * oh * ow;
        check_len("input", input, batch_size * in_len);
        check_len("output", output, batch_size * out_len);

        for (out, inp) in output
            .chunks_exact_mut(out_len.max(1))
            .zip(input.chunks_exact(in_len.max(1)))
        {
            for c in 0..self.channels {
                for y in 0..oh {
                    let row = (c * self.input_height + y / self.factor_height) * self.input_width;
                    for x in 0..ow {
                        out[(c * oh + y) * ow + x] = inp[row + x / self.factor_width];
                    }
                }
            }
        }
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let (oh, ow) = self.out_dims();
        let in_len = self.channels * self.input_height * self.input_width;
        let out_len = self.channels * oh * ow;
        check_len("grad_output", grad_output, batch_size * out_len);
        check_len("grad_input", grad_input, batch_size * in_len);

        grad_input.iter_mut().for_each(|v| *v = 0.0);
        for (gin, gout) in grad_input
            .chunks_exact_mut(in_len.max(1))
            .zip(grad_output.chunks_exact(out_len.max(1)))
        {
            for c in 0..self.channels {
                for y in 0..oh {
                    let row = (c * self.input_height + y / self.factor_height) * self.input_width;
                    for x in 0..ow {
                        gin[row + x / self.factor_width] += gout[(c * oh + y) * ow + x];
                    }
                }
            }
        }
    }
}
