use std::f64::consts::LN_2;

use checkpoint::{OptimizerState, Snapshot};
use distributed::Coordinator;
use log::debug;
use metrics::MetricsRegistry;
use ml::{Adam, AdamConfig, Batch, Criterion, FixedSchedule, Model, clip_grad_norm};
use rand::rngs::StdRng;

use crate::RunStatus;
use crate::error::Result;

/// Trainer knobs that are not optimizer hyperparameters.
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    /// Clip threshold for the reduced gradient; 0 disables clipping.
    pub clip_norm: f32,
    /// Byte limit for gathering validation payloads across workers.
    pub all_gather_buffer: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    EpochActive,
    StepActive,
    Validating,
}

/// Stats returned from a successfully applied step. A skipped step (numeric
/// overflow on any rank) yields `None` instead.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    pub loss: f64,
    pub batch_size: usize,
}

/// The per-step/per-epoch execution unit.
///
/// Owns the model parameters, criterion, optimizer state, and update
/// counters. Gradients are synchronized across workers inside `train_step`;
/// per-step scalars land in whatever metrics contexts are active at the
/// call site.
pub struct Trainer {
    model: Box<dyn Model>,
    criterion: Box<dyn Criterion>,
    optimizer: Adam,
    schedule: FixedSchedule,
    coordinator: Coordinator,
    cfg: TrainerConfig,

    params: Vec<f32>,
    grad: Vec<f32>,
    logits: Vec<f32>,
    dlogits: Vec<f32>,
    valid_pairs: Vec<(f32, f32)>,

    epoch_lr: f32,
    epoch: u64,
    num_updates: u64,
    phase: Phase,
}

impl Trainer {
    pub fn new(
        model: Box<dyn Model>,
        criterion: Box<dyn Criterion>,
        adam: AdamConfig,
        schedule: FixedSchedule,
        coordinator: Coordinator,
        cfg: TrainerConfig,
        rng: &mut StdRng,
    ) -> Self {
        // Identical seeds give identical initial parameters on every rank,
        // so no init broadcast is needed.
        let params = model.init_params(rng);
        let n = params.len();
        let epoch_lr = schedule.epoch_lr(1);

        Self {
            optimizer: Adam::new(n, adam),
            grad: vec![0.0; n],
            logits: Vec::new(),
            dlogits: Vec::new(),
            valid_pairs: Vec::new(),
            model,
            criterion,
            schedule,
            coordinator,
            cfg,
            params,
            epoch_lr,
            epoch: 0,
            num_updates: 0,
            phase: Phase::Idle,
        }
    }

    pub fn num_updates(&self) -> u64 {
        self.num_updates
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn params(&self) -> &[f32] {
        &self.params
    }

    /// Enters a training epoch. Per-epoch-only state (the reshuffled batch
    /// order) is owned by the loader and reset by the caller alongside this.
    pub fn begin_epoch(&mut self, epoch: u64) {
        debug_assert!(matches!(self.phase, Phase::Idle | Phase::EpochActive));
        self.epoch = epoch;
        self.phase = Phase::EpochActive;
    }

    /// One forward/backward/update over `batch`.
    ///
    /// Numeric failures (non-finite loss or gradient) are voted across all
    /// ranks: if any rank overflowed, every rank skips the step in lockstep
    /// — keeping collective calls aligned — and `Ok(None)` is returned. The
    /// caller must not treat a skipped step as a logged step.
    pub fn train_step(
        &mut self,
        batch: &Batch,
        metrics: &MetricsRegistry,
    ) -> Result<Option<StepOutput>> {
        debug_assert_eq!(self.phase, Phase::EpochActive);
        self.phase = Phase::StepActive;

        self.model.forward(&self.params, batch, &mut self.logits);
        let out = self
            .criterion
            .compute(&self.logits, batch, &mut self.dlogits);

        self.grad.fill(0.0);
        self.model
            .backward(&self.params, batch, &self.dlogits, &mut self.grad);

        let overflowed =
            !out.loss.is_finite() || self.grad.iter().any(|g| !g.is_finite());
        let mut votes = [if overflowed { 1.0 } else { 0.0 }];
        self.coordinator.all_reduce_sum(&mut votes)?;
        if votes[0] > 0.0 {
            debug!(
                "skipping step at update {}: non-finite loss/gradient on {} rank(s)",
                self.num_updates, votes[0]
            );
            self.phase = Phase::EpochActive;
            return Ok(None);
        }

        self.coordinator.all_reduce_mean(&mut self.grad)?;
        let gnorm = clip_grad_norm(&mut self.grad, self.cfg.clip_norm);

        let lr = self.schedule.update_lr(self.epoch_lr, self.num_updates);
        self.optimizer.set_lr(lr);
        self.optimizer.step(&self.grad, &mut self.params)?;
        self.num_updates += 1;

        metrics.log_scalar("loss", out.loss / LN_2, out.batch_size as f64);
        metrics.log_scalar("batch_size", out.batch_size as f64, 1.0);
        metrics.log_scalar("gnorm", f64::from(gnorm), 1.0);
        metrics.log_latest("lr", f64::from(lr));
        metrics.log_latest("num_updates", self.num_updates as f64);

        self.phase = Phase::EpochActive;
        Ok(Some(StepOutput {
            loss: out.loss,
            batch_size: out.batch_size,
        }))
    }

    /// Enters the read-only validation pass.
    pub fn begin_valid_epoch(&mut self, epoch: u64) {
        debug_assert!(matches!(self.phase, Phase::Idle | Phase::EpochActive));
        self.epoch = epoch;
        self.valid_pairs.clear();
        self.phase = Phase::Validating;
    }

    /// Forward-only evaluation of one batch: no optimizer mutation, no
    /// gradient sync. Scores accumulate for end-of-epoch ranking.
    pub fn valid_step(&mut self, batch: &Batch, metrics: &MetricsRegistry) {
        debug_assert_eq!(self.phase, Phase::Validating);

        self.model.forward(&self.params, batch, &mut self.logits);
        let out = self
            .criterion
            .compute(&self.logits, batch, &mut self.dlogits);

        metrics.log_scalar("loss", out.loss / LN_2, out.batch_size as f64);
        self.valid_pairs.extend(out.pairs);
    }

    /// Gathers every rank's validation pairs and scores the full set.
    ///
    /// Collective: all ranks must call this once per validation pass.
    /// Returns `None` when the validation set cannot be scored (empty, or
    /// single-class).
    pub fn end_valid_epoch(&mut self) -> Result<Option<f64>> {
        debug_assert_eq!(self.phase, Phase::Validating);

        let local = std::mem::take(&mut self.valid_pairs);
        let gathered = self
            .coordinator
            .all_gather(&local, self.cfg.all_gather_buffer)?;
        let all: Vec<(f32, f32)> = gathered.into_iter().flatten().collect();

        self.phase = Phase::Idle;
        Ok(ml::auroc(&all))
    }

    /// Applies the learning-rate schedule for the epoch that just finished
    /// and returns the rate for the next one. Exactly once per completed
    /// epoch, after validation.
    pub fn lr_step(&mut self, epoch: u64, _valid_score: Option<f64>) -> f32 {
        self.epoch_lr = self.schedule.epoch_lr(epoch + 1);
        self.optimizer.set_lr(self.epoch_lr);
        self.epoch_lr
    }

    /// The run snapshot to persist for `run`.
    pub fn snapshot(&self, run: &RunStatus) -> Snapshot {
        let (exp_avg, exp_avg_sq, beta1_power, beta2_power) = self.optimizer.state();
        Snapshot {
            epoch: run.epoch,
            num_updates: self.num_updates,
            best_score: run.best_score,
            seed: run.seed,
            model_params: self.params.clone(),
            optimizer: Some(OptimizerState {
                exp_avg: exp_avg.to_vec(),
                exp_avg_sq: exp_avg_sq.to_vec(),
                beta1_power,
                beta2_power,
            }),
        }
    }

    /// Restores counters, parameters, and optimizer state from a snapshot.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.model_params.len() != self.params.len() {
            return Err(ml::MlError::SizeMismatch {
                what: "checkpointed parameters",
                got: snapshot.model_params.len(),
                expected: self.params.len(),
            }
            .into());
        }

        self.params.copy_from_slice(&snapshot.model_params);
        if let Some(opt) = &snapshot.optimizer {
            self.optimizer.restore(
                &opt.exp_avg,
                &opt.exp_avg_sq,
                opt.beta1_power,
                opt.beta2_power,
            )?;
        }
        self.num_updates = snapshot.num_updates;
        self.epoch = snapshot.epoch;
        self.epoch_lr = self.schedule.epoch_lr(snapshot.epoch + 1);
        self.phase = Phase::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ml::{ModelSpec, Registry};
    use rand::SeedableRng;

    fn trainer() -> Trainer {
        let registry = Registry::builtin();
        let spec = ModelSpec {
            feature_dim: 2,
            target_dim: 1,
            hidden_dim: 4,
        };
        let mut rng = StdRng::seed_from_u64(7);
        Trainer::new(
            registry.build_model("linear", &spec).unwrap(),
            registry.build_criterion("multitask_bce").unwrap(),
            AdamConfig {
                lr: 0.05,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 0.0,
            },
            FixedSchedule::new(0.05, 0.1, 0, None),
            Coordinator::solo(),
            TrainerConfig {
                clip_norm: 0.0,
                all_gather_buffer: 1 << 20,
            },
            &mut rng,
        )
    }

    fn batch(xs: Vec<f32>, ys: Vec<f32>) -> Batch {
        Batch {
            len: ys.len(),
            feature_dim: 2,
            target_dim: 1,
            xs,
            ys,
        }
    }

    #[test]
    fn applied_steps_count_updates_and_log_scalars() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();
        let b = batch(vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 0.0]);

        t.begin_epoch(1);
        let _guard = metrics.aggregate("train_inner");
        let out = t.train_step(&b, &metrics).unwrap();

        assert!(out.is_some());
        assert_eq!(t.num_updates(), 1);
        let stats = metrics.get_smoothed_values("train_inner");
        assert!(stats.contains_key("loss"));
        assert_eq!(stats["num_updates"], 1.0);
    }

    #[test]
    fn overflow_step_is_skipped_without_side_effects() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();
        let poisoned = batch(vec![f32::NAN, 0.0], vec![1.0]);

        t.begin_epoch(1);
        let params_before = t.params().to_vec();
        let out = {
            let _guard = metrics.aggregate("train_inner");
            t.train_step(&poisoned, &metrics).unwrap()
        };

        assert!(out.is_none());
        assert_eq!(t.num_updates(), 0);
        assert_eq!(t.params(), params_before.as_slice());
        assert!(metrics.get_smoothed_values("train_inner").is_empty());
    }

    #[test]
    fn training_reduces_the_loss_on_a_separable_batch() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();
        let b = batch(vec![1.0, 0.0, -1.0, 0.0], vec![1.0, 0.0]);

        t.begin_epoch(1);
        let first = t.train_step(&b, &metrics).unwrap().unwrap().loss;
        let mut last = first;
        for _ in 0..30 {
            last = t.train_step(&b, &metrics).unwrap().unwrap().loss;
        }
        assert!(last < first, "loss {last} did not improve on {first}");
    }

    #[test]
    fn valid_steps_mutate_nothing() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();
        let b = batch(vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 0.0]);

        t.begin_valid_epoch(1);
        let params_before = t.params().to_vec();
        t.valid_step(&b, &metrics);
        let score = t.end_valid_epoch().unwrap();

        assert_eq!(t.params(), params_before.as_slice());
        assert_eq!(t.num_updates(), 0);
        assert!(score.is_some());
    }

    #[test]
    fn single_class_validation_has_no_score() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();

        t.begin_valid_epoch(1);
        t.valid_step(&batch(vec![1.0, 0.0], vec![1.0]), &metrics);
        assert_eq!(t.end_valid_epoch().unwrap(), None);
    }

    #[test]
    fn snapshot_restore_round_trips_counters() {
        let mut t = trainer();
        let metrics = MetricsRegistry::new();
        let b = batch(vec![1.0, 0.0, 0.0, 1.0], vec![1.0, 0.0]);

        t.begin_epoch(1);
        for _ in 0..3 {
            t.train_step(&b, &metrics).unwrap();
        }

        let run = RunStatus {
            epoch: 1,
            num_updates: t.num_updates(),
            best_score: Some(0.7),
            seed: 7,
        };
        let snap = t.snapshot(&run);

        let mut restored = trainer();
        restored.restore(&snap).unwrap();
        assert_eq!(restored.num_updates(), 3);
        assert_eq!(restored.params(), t.params());
    }

    #[test]
    fn lr_step_applies_the_anneal() {
        let registry = Registry::builtin();
        let spec = ModelSpec {
            feature_dim: 2,
            target_dim: 1,
            hidden_dim: 4,
        };
        let mut rng = StdRng::seed_from_u64(7);
        let mut t = Trainer::new(
            registry.build_model("linear", &spec).unwrap(),
            registry.build_criterion("multitask_bce").unwrap(),
            AdamConfig {
                lr: 1.0,
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 0.0,
            },
            FixedSchedule::new(1.0, 0.5, 0, Some(2)),
            Coordinator::solo(),
            TrainerConfig {
                clip_norm: 0.0,
                all_gather_buffer: 1 << 20,
            },
            &mut rng,
        );

        assert_eq!(t.lr_step(1, None), 0.5);
        assert_eq!(t.lr_step(2, None), 0.25);
    }
}
