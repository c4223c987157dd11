use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

use crate::loader::Batch;

const WEIGHT_STD: f32 = 0.02;

/// A model over a flat parameter vector.
///
/// Parameters and gradients are plain `f32` buffers so the orchestration
/// layer can all-reduce and checkpoint them without knowing the
/// architecture. `forward` must be deterministic for fixed inputs.
pub trait Model: Send {
    fn name(&self) -> &'static str;

    fn num_params(&self) -> usize;

    fn init_params(&self, rng: &mut StdRng) -> Vec<f32>;

    /// Computes logits for every sample; `logits` is resized to
    /// `batch.len * target_dim`.
    fn forward(&self, params: &[f32], batch: &Batch, logits: &mut Vec<f32>);

    /// Accumulates `d(loss)/d(params)` into `grad` given `d(loss)/d(logits)`.
    fn backward(&self, params: &[f32], batch: &Batch, dlogits: &[f32], grad: &mut [f32]);
}

fn normal_init(len: usize, rng: &mut StdRng) -> Vec<f32> {
    let normal = Normal::new(0.0_f32, WEIGHT_STD).expect("std dev is positive");
    (0..len).map(|_| normal.sample(rng)).collect()
}

/// Per-task linear scorer: `logits = W x + b`.
///
/// Parameter layout: `W` row-major `[out][in]`, then `b` `[out]`.
#[derive(Debug, Clone)]
pub struct LinearModel {
    in_dim: usize,
    out_dim: usize,
}

impl LinearModel {
    pub fn new(in_dim: usize, out_dim: usize) -> Self {
        Self { in_dim, out_dim }
    }

    fn weights<'p>(&self, params: &'p [f32]) -> (&'p [f32], &'p [f32]) {
        params.split_at(self.in_dim * self.out_dim)
    }
}

impl Model for LinearModel {
    fn name(&self) -> &'static str {
        "linear"
    }

    fn num_params(&self) -> usize {
        self.in_dim * self.out_dim + self.out_dim
    }

    fn init_params(&self, rng: &mut StdRng) -> Vec<f32> {
        let mut params = normal_init(self.in_dim * self.out_dim, rng);
        params.resize(self.num_params(), 0.0); // zero biases
        params
    }

    fn forward(&self, params: &[f32], batch: &Batch, logits: &mut Vec<f32>) {
        let (w, b) = self.weights(params);
        logits.resize(batch.len * self.out_dim, 0.0);

        logits
            .par_chunks_mut(self.out_dim)
            .zip(batch.xs.par_chunks(self.in_dim))
            .for_each(|(row, x)| {
                for (o, out) in row.iter_mut().enumerate() {
                    let w_row = &w[o * self.in_dim..(o + 1) * self.in_dim];
                    *out = b[o] + dot(w_row, x);
                }
            });
    }

    fn backward(&self, _params: &[f32], batch: &Batch, dlogits: &[f32], grad: &mut [f32]) {
        let (gw, gb) = grad.split_at_mut(self.in_dim * self.out_dim);
        for (dl_row, x) in dlogits
            .chunks(self.out_dim)
            .zip(batch.xs.chunks(self.in_dim))
        {
            for (o, &dl) in dl_row.iter().enumerate() {
                if dl == 0.0 {
                    continue;
                }
                let gw_row = &mut gw[o * self.in_dim..(o + 1) * self.in_dim];
                for (g, &xi) in gw_row.iter_mut().zip(x) {
                    *g += dl * xi;
                }
                gb[o] += dl;
            }
        }
    }
}

/// One-hidden-layer tanh network: `logits = W2 tanh(W1 x + b1) + b2`.
///
/// Parameter layout: `W1 [h][in], b1 [h], W2 [out][h], b2 [out]`. The
/// backward pass recomputes hidden activations instead of caching them; the
/// reference models are small enough that this beats carrying state.
#[derive(Debug, Clone)]
pub struct MlpModel {
    in_dim: usize,
    hidden_dim: usize,
    out_dim: usize,
}

impl MlpModel {
    pub fn new(in_dim: usize, hidden_dim: usize, out_dim: usize) -> Self {
        Self {
            in_dim,
            hidden_dim,
            out_dim,
        }
    }

    fn split<'p>(&self, params: &'p [f32]) -> (&'p [f32], &'p [f32], &'p [f32], &'p [f32]) {
        let (w1, rest) = params.split_at(self.hidden_dim * self.in_dim);
        let (b1, rest) = rest.split_at(self.hidden_dim);
        let (w2, b2) = rest.split_at(self.out_dim * self.hidden_dim);
        (w1, b1, w2, b2)
    }

    fn hidden(&self, w1: &[f32], b1: &[f32], x: &[f32], h: &mut [f32]) {
        for (j, out) in h.iter_mut().enumerate() {
            let w_row = &w1[j * self.in_dim..(j + 1) * self.in_dim];
            *out = (b1[j] + dot(w_row, x)).tanh();
        }
    }
}

impl Model for MlpModel {
    fn name(&self) -> &'static str {
        "mlp"
    }

    fn num_params(&self) -> usize {
        self.hidden_dim * self.in_dim
            + self.hidden_dim
            + self.out_dim * self.hidden_dim
            + self.out_dim
    }

    fn init_params(&self, rng: &mut StdRng) -> Vec<f32> {
        let mut params = Vec::with_capacity(self.num_params());
        params.extend(normal_init(self.hidden_dim * self.in_dim, rng));
        params.extend(std::iter::repeat_n(0.0, self.hidden_dim));
        params.extend(normal_init(self.out_dim * self.hidden_dim, rng));
        params.extend(std::iter::repeat_n(0.0, self.out_dim));
        params
    }

    fn forward(&self, params: &[f32], batch: &Batch, logits: &mut Vec<f32>) {
        let (w1, b1, w2, b2) = self.split(params);
        logits.resize(batch.len * self.out_dim, 0.0);

        logits
            .par_chunks_mut(self.out_dim)
            .zip(batch.xs.par_chunks(self.in_dim))
            .for_each(|(row, x)| {
                let mut h = vec![0.0_f32; self.hidden_dim];
                self.hidden(w1, b1, x, &mut h);
                for (o, out) in row.iter_mut().enumerate() {
                    let w_row = &w2[o * self.hidden_dim..(o + 1) * self.hidden_dim];
                    *out = b2[o] + dot(w_row, &h);
                }
            });
    }

    fn backward(&self, params: &[f32], batch: &Batch, dlogits: &[f32], grad: &mut [f32]) {
        let (w1, b1, w2, _) = self.split(params);
        let (gw1, rest) = grad.split_at_mut(self.hidden_dim * self.in_dim);
        let (gb1, rest) = rest.split_at_mut(self.hidden_dim);
        let (gw2, gb2) = rest.split_at_mut(self.out_dim * self.hidden_dim);

        let mut h = vec![0.0_f32; self.hidden_dim];
        let mut dh = vec![0.0_f32; self.hidden_dim];

        for (dl_row, x) in dlogits
            .chunks(self.out_dim)
            .zip(batch.xs.chunks(self.in_dim))
        {
            self.hidden(w1, b1, x, &mut h);
            dh.fill(0.0);

            for (o, &dl) in dl_row.iter().enumerate() {
                if dl == 0.0 {
                    continue;
                }
                let w_row = &w2[o * self.hidden_dim..(o + 1) * self.hidden_dim];
                let gw_row = &mut gw2[o * self.hidden_dim..(o + 1) * self.hidden_dim];
                for j in 0..self.hidden_dim {
                    gw_row[j] += dl * h[j];
                    dh[j] += dl * w_row[j];
                }
                gb2[o] += dl;
            }

            for j in 0..self.hidden_dim {
                // tanh' = 1 - tanh^2
                let dz = dh[j] * (1.0 - h[j] * h[j]);
                if dz == 0.0 {
                    continue;
                }
                let gw_row = &mut gw1[j * self.in_dim..(j + 1) * self.in_dim];
                for (g, &xi) in gw_row.iter_mut().zip(x) {
                    *g += dz * xi;
                }
                gb1[j] += dz;
            }
        }
    }
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn batch(xs: Vec<f32>, feature_dim: usize, target_dim: usize) -> Batch {
        let len = xs.len() / feature_dim;
        Batch {
            len,
            feature_dim,
            target_dim,
            ys: vec![0.0; len * target_dim],
            xs,
        }
    }

    #[test]
    fn linear_forward_matches_hand_computation() {
        let model = LinearModel::new(2, 1);
        // W = [[2, -1]], b = [0.5]
        let params = vec![2.0, -1.0, 0.5];
        let batch = batch(vec![1.0, 1.0, 3.0, 0.0], 2, 1);

        let mut logits = Vec::new();
        model.forward(&params, &batch, &mut logits);
        assert_eq!(logits, vec![1.5, 6.5]);
    }

    #[test]
    fn linear_backward_accumulates_outer_products() {
        let model = LinearModel::new(2, 1);
        let params = vec![0.0, 0.0, 0.0];
        let batch = batch(vec![1.0, 2.0, 3.0, 4.0], 2, 1);

        let mut grad = vec![0.0; model.num_params()];
        model.backward(&params, &batch, &[1.0, 0.5], &mut grad);
        // gW = 1*[1,2] + 0.5*[3,4]; gb = 1.5
        assert_eq!(grad, vec![2.5, 4.0, 1.5]);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(3);
        let model = MlpModel::new(3, 4, 2);
        let params = model.init_params(&mut rng);
        let batch = batch(vec![0.3, -0.6, 0.9, 0.2, 0.1, -0.4], 3, 2);

        // Scalar objective: sum of logits.
        let objective = |p: &[f32]| -> f64 {
            let mut logits = Vec::new();
            model.forward(p, &batch, &mut logits);
            logits.iter().map(|&v| v as f64).sum()
        };

        let mut grad = vec![0.0; model.num_params()];
        model.backward(
            &params,
            &batch,
            &vec![1.0; batch.len * 2],
            &mut grad,
        );

        let eps = 1e-3;
        for i in (0..params.len()).step_by(7) {
            let mut bumped = params.clone();
            bumped[i] += eps;
            let numeric = (objective(&bumped) - objective(&params)) / eps as f64;
            assert!(
                (numeric - grad[i] as f64).abs() < 1e-2,
                "param {i}: numeric {numeric} vs analytic {}",
                grad[i]
            );
        }
    }

    #[test]
    fn init_is_seed_deterministic() {
        let model = LinearModel::new(4, 3);
        let a = model.init_params(&mut StdRng::seed_from_u64(11));
        let b = model.init_params(&mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
        assert_eq!(a.len(), model.num_params());
    }
}
