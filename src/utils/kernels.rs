//! Data-parallel numeric kernels.
//!
//! Every kernel splits its *output* into disjoint regions (rows, samples or
//! filters) that are computed by independent rayon tasks. Within a region the
//! reduction order is fixed, so results are bitwise identical regardless of the
//! number of worker threads.

use rayon::prelude::*;

/// `c (m×n) = a (m×k) · b (k×n)`, all row-major.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    assert_eq!(a.len(), m * k, "matmul: lhs length mismatch");
    assert_eq!(b.len(), k * n, "matmul: rhs length mismatch");
    assert_eq!(c.len(), m * n, "matmul: output length mismatch");
    if n == 0 {
        return;
    }

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        row.iter_mut().for_each(|v| *v = 0.0);
        let a_row = &a[i * k..(i + 1) * k];
        for (p, &a_ip) in a_row.iter().enumerate() {
            let b_row = &b[p * n..(p + 1) * n];
            for (cv, &bv) in row.iter_mut().zip(b_row) {
                *cv += a_ip * bv;
            }
        }
    });
}

/// `c (m×n) = a (m×k) · bᵀ` where `b` is stored as `n×k`.
pub fn matmul_bt(a: &[f32], b: &[f32], c: &mut [f32], m: usize, k: usize, n: usize) {
    assert_eq!(a.len(), m * k, "matmul_bt: lhs length mismatch");
    assert_eq!(b.len(), n * k, "matmul_bt: rhs length mismatch");
    assert_eq!(c.len(), m * n, "matmul_bt: output length mismatch");
    if n == 0 {
        return;
    }

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, cv) in row.iter_mut().enumerate() {
            let b_row = &b[j * k..(j + 1) * k];
            *cv = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        }
    });
}

/// `c (k×n) += alpha · aᵀ · b` where `a` is `m×k` and `b` is `m×n`.
///
/// This is the weight-gradient kernel: each row of `c` reduces over the `m`
/// samples in order.
pub fn matmul_at_acc(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    k: usize,
    n: usize,
    alpha: f32,
) {
    assert_eq!(a.len(), m * k, "matmul_at_acc: lhs length mismatch");
    assert_eq!(b.len(), m * n, "matmul_at_acc: rhs length mismatch");
    assert_eq!(c.len(), k * n, "matmul_at_acc: output length mismatch");
    if n == 0 {
        return;
    }

    c.par_chunks_mut(n).enumerate().for_each(|(p, row)| {
        for i in 0..m {
            let scale = alpha * a[i * k + p];
            let b_row = &b[i * n..(i + 1) * n];
            for (cv, &bv) in row.iter_mut().zip(b_row) {
                *cv += scale * bv;
            }
        }
    });
}

/// `out[j] += alpha · Σ_i b[i][j]` for a row-major `b` with rows of `n` values.
pub fn sum_rows_acc(b: &[f32], out: &mut [f32], n: usize, alpha: f32) {
    assert_eq!(out.len(), n);
    if n == 0 {
        return;
    }
    for row in b.chunks_exact(n) {
        for (o, &v) in out.iter_mut().zip(row) {
            *o += alpha * v;
        }
    }
}

/// Add `bias` to every row of `c`.
pub fn add_bias_rows(c: &mut [f32], bias: &[f32]) {
    let n = bias.len();
    if n == 0 {
        return;
    }
    c.par_chunks_mut(n).for_each(|row| {
        for (v, &b) in row.iter_mut().zip(bias) {
            *v += b;
        }
    });
}

/// Geometry of a 2D correlation between `[in_channels, in_height, in_width]`
/// inputs and `[out_channels, in_channels, kernel_height, kernel_width]` filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub in_channels: usize,
    pub in_height: usize,
    pub in_width: usize,
    pub out_channels: usize,
    pub kernel_height: usize,
    pub kernel_width: usize,
    pub stride: usize,
    pub padding: usize,
    pub out_height: usize,
    pub out_width: usize,
}

impl ConvGeometry {
    /// Returns `None` when the kernel does not fit the padded input or the stride is zero.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        in_height: usize,
        in_width: usize,
        out_channels: usize,
        kernel_height: usize,
        kernel_width: usize,
        stride: usize,
        padding: usize,
    ) -> Option<Self> {
        if stride == 0 || kernel_height == 0 || kernel_width == 0 {
            return None;
        }
        let padded_h = in_height + 2 * padding;
        let padded_w = in_width + 2 * padding;
        if kernel_height > padded_h || kernel_width > padded_w {
            return None;
        }
        Some(Self {
            in_channels,
            in_height,
            in_width,
            out_channels,
            kernel_height,
            kernel_width,
            stride,
            padding,
            out_height: (padded_h - kernel_height) / stride + 1,
            out_width: (padded_w - kernel_width) / stride + 1,
        })
    }

    pub fn input_len(&self) -> usize {
        self.in_channels * self.in_height * self.in_width
    }

    pub fn output_len(&self) -> usize {
        self.out_channels * self.out_height * self.out_width
    }

    pub fn weight_len(&self) -> usize {
        self.out_channels * self.in_channels * self.kernel_height * self.kernel_width
    }

    /// Input coordinate touched by output row/col `o` and kernel offset `p`.
    #[inline]
    fn source(&self, o: usize, p: usize, extent: usize) -> Option<usize> {
        let pos = (o * self.stride + p) as isize - self.padding as isize;
        if pos < 0 || pos as usize >= extent {
            None
        } else {
            Some(pos as usize)
        }
    }

    #[inline]
    fn weight_index(&self, k: usize, c: usize, p: usize, q: usize) -> usize {
        ((k * self.in_channels + c) * self.kernel_height + p) * self.kernel_width + q
    }
}

/// Batched correlation `output = input ⋆ weights` (no bias). Overwrites `output`.
pub fn conv2d_forward(
    input: &[f32],
    weights: &[f32],
    output: &mut [f32],
    g: &ConvGeometry,
    batch_size: usize,
) {
    assert_eq!(input.len(), batch_size * g.input_len(), "conv2d_forward: input length mismatch");
    assert_eq!(output.len(), batch_size * g.output_len(), "conv2d_forward: output length mismatch");
    assert_eq!(weights.len(), g.weight_len(), "conv2d_forward: weight length mismatch");
    if g.output_len() == 0 || g.input_len() == 0 {
        return;
    }

    output
        .par_chunks_mut(g.output_len())
        .zip(input.par_chunks(g.input_len()))
        .for_each(|(out, inp)| {
            for k in 0..g.out_channels {
                for oy in 0..g.out_height {
                    for ox in 0..g.out_width {
                        let mut sum = 0.0f32;
                        for c in 0..g.in_channels {
                            for p in 0..g.kernel_height {
                                let Some(iy) = g.source(oy, p, g.in_height) else { continue };
                                for q in 0..g.kernel_width {
                                    let Some(ix) = g.source(ox, q, g.in_width) else { continue };
                                    sum += weights[g.weight_index(k, c, p, q)]
                                        * inp[(c * g.in_height + iy) * g.in_width + ix];
                                }
                            }
                        }
                        out[(k * g.out_height + oy) * g.out_width + ox] = sum;
                    }
                }
            }
        });
}

/// Batched full convolution scattering `grad_output` back through `weights`.
/// Overwrites `grad_input`.
pub fn conv2d_backward_input(
    grad_output: &[f32],
    weights: &[f32],
    grad_input: &mut [f32],
    g: &ConvGeometry,
    batch_size: usize,
) {
    assert_eq!(
        grad_output.len(),
        batch_size * g.output_len(),
        "conv2d_backward_input: grad_output length mismatch"
    );
    assert_eq!(
        grad_input.len(),
        batch_size * g.input_len(),
        "conv2d_backward_input: grad_input length mismatch"
    );
    assert_eq!(weights.len(), g.weight_len(), "conv2d_backward_input: weight length mismatch");
    if g.output_len() == 0 || g.input_len() == 0 {
        return;
    }

    grad_input
        .par_chunks_mut(g.input_len())
        .zip(grad_output.par_chunks(g.output_len()))
        .for_each(|(gin, gout)| {
            gin.iter_mut().for_each(|v| *v = 0.0);
            for k in 0..g.out_channels {
                for oy in 0..g.out_height {
                    for ox in 0..g.out_width {
                        let gv = gout[(k * g.out_height + oy) * g.out_width + ox];
                        for c in 0..g.in_channels {
                            for p in 0..g.kernel_height {
                                let Some(iy) = g.source(oy, p, g.in_height) else { continue };
                                for q in 0..g.kernel_width {
                                    let Some(ix) = g.source(ox, q, g.in_width) else { continue };
                                    gin[(c * g.in_height + iy) * g.in_width + ix] +=
                                        weights[g.weight_index(k, c, p, q)] * gv;
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// `grad_weights += alpha · Σ_batch input ⋆ grad_output`, one task per output channel.
pub fn conv2d_backward_weights(
    input: &[f32],
    grad_output: &[f32],
    grad_weights: &mut [f32],
    g: &ConvGeometry,
    batch_size: usize,
    alpha: f32,
) {
    assert_eq!(
        input.len(),
        batch_size * g.input_len(),
        "conv2d_backward_weights: input length mismatch"
    );
    assert_eq!(
        grad_output.len(),
        batch_size * g.output_len(),
        "conv2d_backward_weights: grad_output length mismatch"
    );
    assert_eq!(
        grad_weights.len(),
        g.weight_len(),
        "conv2d_backward_weights: weight length mismatch"
    );
    let filter_len = g.in_channels * g.kernel_height * g.kernel_width;
    if filter_len == 0 {
        return;
    }

    grad_weights
        .par_chunks_mut(filter_len)
        .enumerate()
        .for_each(|(k, gw)| {
            for b in 0..batch_size {
                let inp = &input[b * g.input_len()..(b + 1) * g.input_len()];
                let gout = &grad_output[b * g.output_len()..(b + 1) * g.output_len()];
                for oy in 0..g.out_height {
                    for ox in 0..g.out_width {
                        let gv = alpha * gout[(k * g.out_height + oy) * g.out_width + ox];
                        for c in 0..g.in_channels {
                            for p in 0..g.kernel_height {
                                let Some(iy) = g.source(oy, p, g.in_height) else { continue };
                                for q in 0..g.kernel_width {
                                    let Some(ix) = g.source(ox, q, g.in_width) else { continue };
                                    gw[(c * g.kernel_height + p) * g.kernel_width + q] +=
                                        gv * inp[(c * g.in_height + iy) * g.in_width + ix];
                                }
                            }
                        }
                    }
                }
            }
        });
}

/// Per-channel sums of a batch of `[channels, spatial]` maps: `out[c] += alpha · Σ`.
pub fn channel_sums_acc(data: &[f32], out: &mut [f32], spatial: usize, alpha: f32) {
    let channels = out.len();
    if channels == 0 || spatial == 0 {
        return;
    }
    for sample in data.chunks_exact(channels * spatial) {
        for (c, map) in sample.chunks_exact(spatial).enumerate() {
            out[c] += alpha * map.iter().sum::<f32>();
        }
    }
}
