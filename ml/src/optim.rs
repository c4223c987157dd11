use crate::error::{MlError, Result};

/// Adam hyperparameters, as parsed from the run configuration.
#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub lr: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

/// Adam with decoupled L2 applied into the gradient and bias-corrected
/// moment estimates.
#[derive(Debug)]
pub struct Adam {
    lr: f32,
    beta1: f32,
    beta2: f32,
    eps: f32,
    weight_decay: f32,
    beta1_power: f32,
    beta2_power: f32,
    exp_avg: Vec<f32>,
    exp_avg_sq: Vec<f32>,
}

impl Adam {
    pub fn new(len: usize, cfg: AdamConfig) -> Self {
        Self {
            lr: cfg.lr,
            beta1: cfg.beta1,
            beta2: cfg.beta2,
            eps: cfg.eps,
            weight_decay: cfg.weight_decay,
            beta1_power: 1.0,
            beta2_power: 1.0,
            exp_avg: vec![0.0; len],
            exp_avg_sq: vec![0.0; len],
        }
    }

    /// The learning rate applied by the next `step` call; the schedule
    /// rewrites it every update.
    pub fn set_lr(&mut self, lr: f32) {
        self.lr = lr;
    }

    pub fn lr(&self) -> f32 {
        self.lr
    }

    pub fn step(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        if grad.len() != params.len() || grad.len() != self.exp_avg.len() {
            return Err(MlError::SizeMismatch {
                what: "gradient",
                got: grad.len(),
                expected: self.exp_avg.len(),
            });
        }

        let Self {
            lr,
            beta1: b1,
            beta2: b2,
            eps,
            weight_decay,
            ..
        } = *self;

        self.beta1_power *= b1;
        self.beta2_power *= b2;
        let bias1 = 1.0 - self.beta1_power;
        let bias2 = 1.0 - self.beta2_power;
        let step_size = lr * (bias2.sqrt() / bias1);

        params
            .iter_mut()
            .zip(grad)
            .zip(self.exp_avg.iter_mut())
            .zip(self.exp_avg_sq.iter_mut())
            .for_each(|(((p, g), m), v)| {
                let g = g + weight_decay * *p;
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;
                *p -= step_size * *m / (v.sqrt() + eps);
            });

        Ok(())
    }

    /// Moment buffers and beta powers, for checkpointing.
    pub fn state(&self) -> (&[f32], &[f32], f32, f32) {
        (
            &self.exp_avg,
            &self.exp_avg_sq,
            self.beta1_power,
            self.beta2_power,
        )
    }

    /// Restores checkpointed state; lengths must match the parameter count
    /// this optimizer was built for.
    pub fn restore(
        &mut self,
        exp_avg: &[f32],
        exp_avg_sq: &[f32],
        beta1_power: f32,
        beta2_power: f32,
    ) -> Result<()> {
        if exp_avg.len() != self.exp_avg.len() || exp_avg_sq.len() != self.exp_avg_sq.len() {
            return Err(MlError::SizeMismatch {
                what: "optimizer state",
                got: exp_avg.len(),
                expected: self.exp_avg.len(),
            });
        }
        self.exp_avg.copy_from_slice(exp_avg);
        self.exp_avg_sq.copy_from_slice(exp_avg_sq);
        self.beta1_power = beta1_power;
        self.beta2_power = beta2_power;
        Ok(())
    }
}

/// Scales `grad` down to `max_norm` when it exceeds it; returns the
/// pre-clip L2 norm. A non-positive `max_norm` disables clipping.
pub fn clip_grad_norm(grad: &mut [f32], max_norm: f32) -> f32 {
    let norm = grad.iter().map(|g| g * g).sum::<f32>().sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for g in grad.iter_mut() {
            *g *= scale;
        }
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AdamConfig {
        AdamConfig {
            lr: 0.1,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }

    #[test]
    fn first_step_moves_against_the_gradient_by_lr() {
        let mut adam = Adam::new(2, config());
        let mut params = vec![1.0, -1.0];
        adam.step(&[0.5, -0.5], &mut params).unwrap();

        // With bias correction, the first Adam step has magnitude ~lr.
        assert!((params[0] - 0.9).abs() < 1e-3);
        assert!((params[1] + 0.9).abs() < 1e-3);
    }

    #[test]
    fn mismatched_gradient_is_rejected() {
        let mut adam = Adam::new(2, config());
        let err = adam.step(&[1.0], &mut [0.0, 0.0]).unwrap_err();
        assert!(matches!(err, MlError::SizeMismatch { .. }));
    }

    #[test]
    fn state_round_trip_resumes_the_trajectory() {
        let grad = [0.3_f32, -0.7];

        let mut reference = Adam::new(2, config());
        let mut ref_params = vec![0.0, 0.0];
        for _ in 0..3 {
            reference.step(&grad, &mut ref_params).unwrap();
        }

        // Two steps, snapshot, fresh optimizer, restore, third step.
        let mut first = Adam::new(2, config());
        let mut params = vec![0.0, 0.0];
        first.step(&grad, &mut params).unwrap();
        first.step(&grad, &mut params).unwrap();
        let (m, v, b1p, b2p) = first.state();
        let (m, v) = (m.to_vec(), v.to_vec());

        let mut resumed = Adam::new(2, config());
        resumed.restore(&m, &v, b1p, b2p).unwrap();
        resumed.step(&grad, &mut params).unwrap();

        assert_eq!(params, ref_params);
    }

    #[test]
    fn weight_decay_pulls_parameters_toward_zero() {
        let mut cfg = config();
        cfg.weight_decay = 0.5;
        let mut adam = Adam::new(1, cfg);
        let mut params = vec![2.0];
        adam.step(&[0.0], &mut params).unwrap();
        assert!(params[0] < 2.0);
    }

    #[test]
    fn clip_rescales_only_above_the_threshold() {
        let mut grad = vec![3.0, 4.0];
        let norm = clip_grad_norm(&mut grad, 10.0);
        assert_eq!(norm, 5.0);
        assert_eq!(grad, vec![3.0, 4.0]);

        let norm = clip_grad_norm(&mut grad, 1.0);
        assert_eq!(norm, 5.0);
        let clipped = (grad[0] * grad[0] + grad[1] * grad[1]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-3);
    }

    #[test]
    fn zero_clip_norm_disables_clipping() {
        let mut grad = vec![30.0, 40.0];
        assert_eq!(clip_grad_norm(&mut grad, 0.0), 50.0);
        assert_eq!(grad, vec![30.0, 40.0]);
    }
}
