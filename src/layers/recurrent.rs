//! Recurrent layers
//!
//! Simple (Elman) RNN and LSTM layers over fixed-length sequences. Inputs are
//! `[steps, features]` per sample, outputs `[steps, hidden]` with the hidden
//! state of every step. The backward pass unrolls the whole sequence and
//! accumulates parameter gradients over all steps before the single update.

use crate::error::{DbnError, Result};
use crate::layers::r#trait::check_len;
use crate::layers::{Layer, LayerKind, Param};
use crate::shape::Shape;
use crate::utils::activations::sigmoid;
use crate::utils::kernels::{add_bias_rows, matmul, matmul_at_acc, matmul_bt, sum_rows_acc};
use crate::utils::SeededRng;

/// Copy step `t` of every sequence in a `[batch, steps, width]` buffer into a
/// contiguous `batch × width` matrix.
fn gather_step(src: &[f32], t: usize, steps: usize, width: usize, batch_size: usize) -> Vec<f32> {
    let mut out = Vec::with_capacity(batch_size * width);
    for b in 0..batch_size {
        let start = (b * steps + t) * width;
        out.extend_from_slice(&src[start..start + width]);
    }
    out
}

/// Inverse of [`gather_step`].
fn scatter_step(dst: &mut [f32], step: &[f32], t: usize, steps: usize, width: usize) {
    if width == 0 {
        return;
    }
    for (b, row) in step.chunks_exact(width).enumerate() {
        let start = (b * steps + t) * width;
        dst[start..start + width].copy_from_slice(row);
    }
}

fn xavier(rows: usize, cols: usize, rng: &mut SeededRng) -> Vec<f32> {
    let limit = (6.0f32 / (rows + cols).max(1) as f32).sqrt();
    (0..rows * cols).map(|_| rng.gen_range_f32(-limit, limit)).collect()
}

fn check_sequence(steps: usize, input_size: usize, hidden_size: usize) -> Result<()> {
    if steps == 0 || input_size == 0 || hidden_size == 0 {
        return Err(DbnError::InvalidConfig(
            "recurrent layers need positive steps, input and hidden sizes".into(),
        ));
    }
    Ok(())
}

/// Elman RNN: `h_t = tanh(x_t·W + h_{t-1}·U + b)` with `h_{-1} = 0`.
pub struct RnnLayer {
    steps: usize,
    input_size: usize,
    hidden_size: usize,
    w: Param,
    u: Param,
    b: Param,
    /// Hidden states per step, each `batch × hidden`.
    states: Vec<Vec<f32>>,
}

impl RnnLayer {
    pub fn new(
        steps: usize,
        input_size: usize,
        hidden_size: usize,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        check_sequence(steps, input_size, hidden_size)?;
        Ok(Self {
            steps,
            input_size,
            hidden_size,
            w: Param::weights("input_weights", xavier(input_size, hidden_size, rng)),
            u: Param::weights("recurrent_weights", xavier(hidden_size, hidden_size, rng)),
            b: Param::bias("biases", vec![0.0; hidden_size]),
            states: Vec::new(),
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl Layer for RnnLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Rnn
    }

    fn input_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.input_size)
    }

    fn output_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.hidden_size)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let (t_len, d, h) = (self.steps, self.input_size, self.hidden_size);
        check_len("input", input, batch_size * t_len * d);
        check_len("output", output, batch_size * t_len * h);

        self.states.clear();
        let mut prev = vec![0.0f32; batch_size * h];
        let mut recurrent = vec![0.0f32; batch_size * h];
        for t in 0..t_len {
            let x_t = gather_step(input, t, t_len, d, batch_size);
            let mut state = vec![0.0f32; batch_size * h];
            matmul(&x_t, &self.w.value, &mut state, batch_size, d, h);
            matmul(&prev, &self.u.value, &mut recurrent, batch_size, h, h);
            for (s, r) in state.iter_mut().zip(&recurrent) {
                *s += r;
            }
            add_bias_rows(&mut state, &self.b.value);
            state.iter_mut().for_each(|v| *v = v.tanh());

            scatter_step(output, &state, t, t_len, h);
            prev.copy_from_slice(&state);
            self.states.push(state);
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let (t_len, d, h) = (self.steps, self.input_size, self.hidden_size);
        check_len("grad_output", grad_output, batch_size * t_len * h);
        check_len("grad_input", grad_input, batch_size * t_len * d);
        assert_eq!(self.states.len(), t_len, "backward called without a matching forward pass");

        let zeros = vec![0.0f32; batch_size * h];
        let mut dh_next = vec![0.0f32; batch_size * h];
        let mut dx = vec![0.0f32; batch_size * d];
        for t in (0..t_len).rev() {
            let state = &self.states[t];
            let prev = if t == 0 { &zeros } else { &self.states[t - 1] };
            let g_t = gather_step(grad_output, t, t_len, h, batch_size);

            let delta: Vec<f32> = g_t
                .iter()
                .zip(&dh_next)
                .zip(state)
                .map(|((g, n), y)| (g + n) * (1.0 - y * y))
                .collect();

            let x_t = gather_step(input, t, t_len, d, batch_size);
            matmul_at_acc(&x_t, &delta, &mut self.w.grad, batch_size, d, h, 1.0);
            matmul_at_acc(prev, &delta, &mut self.u.grad, batch_size, h, h, 1.0);
            sum_rows_acc(&delta, &mut self.b.grad, h, 1.0);

            matmul_bt(&delta, &self.w.value, &mut dx, batch_size, h, d);
            scatter_step(grad_input, &dx, t, t_len, d);
            matmul_bt(&delta, &self.u.value, &mut dh_next, batch_size, h, h);
        }
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.w, &self.u, &self.b]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.u, &mut self.b]
    }
}

/// Cached activations of one LSTM step.
struct LstmStep {
    /// Gate activations `[i, f, g, o]`, each `batch × hidden`, row-interleaved
    /// as `batch × 4·hidden`.
    gates: Vec<f32>,
    cell: Vec<f32>,
    cell_tanh: Vec<f32>,
    hidden: Vec<f32>,
}

/// Long short-term memory layer.
///
/// Gates are packed as `[input, forget, cell, output]` along the columns of the
/// weight matrices (`input_size × 4·hidden` and `hidden × 4·hidden`). The forget
/// gate bias starts at 1.0.
pub struct LstmLayer {
    steps: usize,
    input_size: usize,
    hidden_size: usize,
    w: Param,
    u: Param,
    b: Param,
    cache: Vec<LstmStep>,
}

impl LstmLayer {
    pub fn new(
        steps: usize,
        input_size: usize,
        hidden_size: usize,
        rng: &mut SeededRng,
    ) -> Result<Self> {
        check_sequence(steps, input_size, hidden_size)?;
        let mut bias = vec![0.0f32; 4 * hidden_size];
        bias[hidden_size..2 * hidden_size].iter_mut().for_each(|v| *v = 1.0);

        Ok(Self {
            steps,
            input_size,
            hidden_size,
            w: Param::weights("input_weights", xavier(input_size, 4 * hidden_size, rng)),
            u: Param::weights("recurrent_weights", xavier(hidden_size, 4 * hidden_size, rng)),
            b: Param::bias("biases", bias),
            cache: Vec::new(),
        })
    }

    pub fn hidden_size(&self) -> usize {
        self.hidden_size
    }
}

impl Layer for LstmLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::Lstm
    }

    fn input_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.input_size)
    }

    fn output_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.hidden_size)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        let (t_len, d, h) = (self.steps, self.input_size, self.hidden_size);
        let h4 = 4 * h;
        check_len("input", input, batch_size * t_len * d);
        check_len("output", output, batch_size * t_len * h);

        self.cache.clear();
        let mut prev_h = vec![0.0f32; batch_size * h];
        let mut prev_c = vec![0.0f32; batch_size * h];
        let mut recurrent = vec![0.0f32; batch_size * h4];
        for t in 0..t_len {
            let x_t = gather_step(input, t, t_len, d, batch_size);
            let mut gates = vec![0.0f32; batch_size * h4];
            matmul(&x_t, &self.w.value, &mut gates, batch_size, d, h4);
            matmul(&prev_h, &self.u.value, &mut recurrent, batch_size, h, h4);
            for (z, r) in gates.iter_mut().zip(&recurrent) {
                *z += r;
            }
            add_bias_rows(&mut gates, &self.b.value);

            let mut cell = vec![0.0f32; batch_size * h];
            let mut cell_tanh = vec![0.0f32; batch_size * h];
            let mut hidden = vec![0.0f32; batch_size * h];
            for b in 0..batch_size {
                let row = &mut gates[b * h4..(b + 1) * h4];
                for j in 0..h {
                    row[j] = sigmoid(row[j]);
                    row[h + j] = sigmoid(row[h + j]);
                    row[2 * h + j] = row[2 * h + j].tanh();
                    row[3 * h + j] = sigmoid(row[3 * h + j]);

                    let k = b * h + j;
                    cell[k] = row[h + j] * prev_c[k] + row[j] * row[2 * h + j];
                    cell_tanh[k] = cell[k].tanh();
                    hidden[k] = row[3 * h + j] * cell_tanh[k];
                }
            }

            scatter_step(output, &hidden, t, t_len, h);
            prev_h.copy_from_slice(&hidden);
            prev_c.copy_from_slice(&cell);
            self.cache.push(LstmStep {
                gates,
                cell,
                cell_tanh,
                hidden,
            });
        }
    }

    fn backward(
        &mut self,
        input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        let (t_len, d, h) = (self.steps, self.input_size, self.hidden_size);
        let h4 = 4 * h;
        check_len("grad_output", grad_output, batch_size * t_len * h);
        check_len("grad_input", grad_input, batch_size * t_len * d);
        assert_eq!(self.cache.len(), t_len, "backward called without a matching forward pass");

        let zeros = vec![0.0f32; batch_size * h];
        let mut dh_next = vec![0.0f32; batch_size * h];
        let mut dc_next = vec![0.0f32; batch_size * h];
        let mut dz = vec![0.0f32; batch_size * h4];
        let mut dx = vec![0.0f32; batch_size * d];
        for t in (0..t_len).rev() {
            let step = &self.cache[t];
            let (prev_h, prev_c) = if t == 0 {
                (&zeros, &zeros)
            } else {
                (&self.cache[t - 1].hidden, &self.cache[t - 1].cell)
            };
            let g_t = gather_step(grad_output, t, t_len, h, batch_size);

            for b in 0..batch_size {
                let gates = &step.gates[b * h4..(b + 1) * h4];
                let dz_row = &mut dz[b * h4..(b + 1) * h4];
                for j in 0..h {
                    let k = b * h + j;
                    let (i, f, g, o) = (gates[j], gates[h + j], gates[2 * h + j], gates[3 * h + j]);
                    let dh = g_t[k] + dh_next[k];
                    let tc = step.cell_tanh[k];
                    let dc = dh * o * (1.0 - tc * tc) + dc_next[k];

                    dz_row[j] = dc * g * i * (1.0 - i);
                    dz_row[h + j] = dc * prev_c[k] * f * (1.0 - f);
                    dz_row[2 * h + j] = dc * i * (1.0 - g * g);
                    dz_row[3 * h + j] = dh * tc * o * (1.0 - o);
                    dc_next[k] = dc * f;
                }
            }

            let x_t = gather_step(input, t, t_len, d, batch_size);
            matmul_at_acc(&x_t, &dz, &mut self.w.grad, batch_size, d, h4, 1.0);
            matmul_at_acc(prev_h, &dz, &mut self.u.grad, batch_size, h, h4, 1.0);
            sum_rows_acc(&dz, &mut self.b.grad, h4, 1.0);

            matmul_bt(&dz, &self.w.value, &mut dx, batch_size, h4, d);
            scatter_step(grad_input, &dx, t, t_len, d);
            matmul_bt(&dz, &self.u.value, &mut dh_next, batch_size, h4, h);
        }
    }

    fn params(&self) -> Vec<&Param> {
        vec![&self.w, &self.u, &self.b]
    }

    fn params_mut(&mut self) -> Vec<&mut Param> {
        vec![&mut self.w, &mut self.u, &mut self.b]
    }
}

/// Keeps only the last step of a sequence: `[steps, features]` → `[features]`.
pub struct LastStepLayer {
    steps: usize,
    features: usize,
}

impl LastStepLayer {
    pub fn new(steps: usize, features: usize) -> Result<Self> {
        if steps == 0 {
            return Err(DbnError::InvalidConfig("sequence must have at least one step".into()));
        }
        Ok(Self { steps, features })
    }
}

impl Layer for LastStepLayer {
    fn kind(&self) -> LayerKind {
        LayerKind::LastStep
    }

    fn input_shape(&self) -> Shape {
        Shape::sequence(self.steps, self.features)
    }

    fn output_shape(&self) -> Shape {
        Shape::flat(self.features)
    }

    fn forward(&mut self, input: &[f32], output: &mut [f32], batch_size: usize) {
        check_len("input", input, batch_size * self.steps * self.features);
        check_len("output", output, batch_size * self.features);
        let last = gather_step(input, self.steps - 1, self.steps, self.features, batch_size);
        output.copy_from_slice(&last);
    }

    fn backward(
        &mut self,
        _input: &[f32],
        grad_output: &[f32],
        grad_input: &mut [f32],
        batch_size: usize,
    ) {
        check_len("grad_output", grad_output, batch_size * self.features);
        check_len("grad_input", grad_input, batch_size * self.steps * self.features);
        grad_input.iter_mut().for_each(|g| *g = 0.0);
        scatter_step(grad_input, grad_output, self.steps - 1, self.steps, self.features);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_scatter_step() {
        // batch 2, steps 3, width 2
        let src: Vec<f32> = (0..12).map(|v| v as f32).collect();
        let step = gather_step(&src, 1, 3, 2, 2);
        assert_eq!(step, vec![2.0, 3.0, 8.0, 9.0]);

        let mut dst = vec![0.0f32; 12];
        scatter_step(&mut dst, &step, 1, 3, 2);
        assert_eq!(&dst[2..4], &[2.0, 3.0]);
        assert_eq!(&dst[8..10], &[8.0, 9.0]);
    }

    #[test]
    fn test_rnn_state_carries_over_steps() {
        let mut rng = SeededRng::new(3);
        let mut layer = RnnLayer::new(2, 1, 1, &mut rng).unwrap();
        layer.params_mut()[0].value.copy_from_slice(&[1.0]);
        layer.params_mut()[1].value.copy_from_slice(&[1.0]);

        let mut output = [0.0; 2];
        layer.forward(&[0.5, 0.0], &mut output, 1);
        assert!((output[0] - 0.5f32.tanh()).abs() < 1e-6);
        assert!((output[1] - output[0].tanh()).abs() < 1e-6);
    }

    #[test]
    fn test_lstm_shapes_and_forget_bias() {
        let mut rng = SeededRng::new(3);
        let layer = LstmLayer::new(5, 3, 4, &mut rng).unwrap();
        assert_eq!(layer.output_shape(), Shape::sequence(5, 4));
        assert_eq!(layer.parameter_count(), 3 * 16 + 4 * 16 + 16);
        assert_eq!(&layer.params()[2].value[4..8], &[1.0; 4]);
    }

    #[test]
    fn test_last_step_routes_gradient() {
        let mut layer = LastStepLayer::new(3, 2).unwrap();
        let input: Vec<f32> = (0..6).map(|v| v as f32).collect();
        let mut output = [0.0; 2];
        layer.forward(&input, &mut output, 1);
        assert_eq!(output, [4.0, 5.0]);

        let mut grad_input = [9.0; 6];
        layer.backward(&input, &[1.0, 2.0], &mut grad_input, 1);
        assert_eq!(grad_input, [0.0, 0.0, 0.0, 0.0, 1.0, 2.0]);
    }
}
