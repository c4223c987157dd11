use std::num::{NonZeroU64, NonZeroUsize};
use std::path::PathBuf;
use std::time::Duration;

use checkpoint::CheckpointConfig;
use clap::Parser;
use distributed::DistributedConfig;
use ml::{AdamConfig, FixedSchedule};

/// Distributed multi-task training over preprocessed features.
#[derive(Debug, Clone, Parser)]
#[command(name = "train")]
pub struct TrainArgs {
    /// Student number identifying this run; used as the default run name.
    #[arg(long = "student_number")]
    pub student_number: String,

    /// Path to the processed features consumed by the dataset loader.
    #[arg(long = "data_path")]
    pub data_path: PathBuf,

    /// Fraction of samples held out for validation.
    #[arg(long = "valid_percent", default_value_t = 0.0)]
    pub valid_percent: f64,

    /// Model variant, resolved through the registry.
    #[arg(long = "model", default_value = "linear")]
    pub model: String,

    /// Criterion variant, resolved through the registry.
    #[arg(long = "criterion", default_value = "multitask_bce")]
    pub criterion: String,

    /// Hidden width for model variants that have one.
    #[arg(long = "hidden_dim", default_value_t = 64)]
    pub hidden_dim: usize,

    /// Learning rate.
    #[arg(long = "lr", default_value_t = 0.005)]
    pub lr: f32,

    /// Per-worker batch size.
    #[arg(long = "batch_size", default_value = "64")]
    pub batch_size: NonZeroUsize,

    /// Train until this epoch (inclusive).
    #[arg(long = "max_epoch", default_value_t = 50)]
    pub max_epoch: u64,

    /// Betas for the Adam optimizer, as "(b1, b2)".
    #[arg(long = "adam_betas", default_value = "(0.9, 0.999)", value_parser = parse_adam_betas)]
    pub adam_betas: (f32, f32),

    /// Epsilon for the Adam optimizer.
    #[arg(long = "adam_eps", default_value_t = 1e-8)]
    pub adam_eps: f32,

    /// Weight decay.
    #[arg(long = "weight_decay", default_value_t = 0.0)]
    pub weight_decay: f32,

    /// Force annealing at the given epoch.
    #[arg(long = "force_anneal")]
    pub force_anneal: Option<u64>,

    /// Shrink factor for annealing: lr_new = lr * lr_shrink.
    #[arg(long = "lr_shrink", default_value_t = 0.1)]
    pub lr_shrink: f32,

    /// Warm the learning rate up linearly for the first N updates.
    #[arg(long = "warmup_updates", default_value_t = 0)]
    pub warmup_updates: u64,

    /// Random seed fixing all randomness sources for the run.
    #[arg(long = "seed", default_value_t = 42)]
    pub seed: u64,

    /// Data-loading worker threads. The in-memory loader is synchronous;
    /// accepted so launch configs stay portable.
    #[arg(long = "num_workers", default_value_t = 6)]
    pub num_workers: usize,

    /// Copy batches into pinned memory before handing them to the device.
    /// Accepted for interface compatibility; no-op on the CPU path.
    #[arg(long = "pin_memory", default_value_t = true, action = clap::ArgAction::Set)]
    pub pin_memory: bool,

    /// Clip threshold for gradient norms; 0 disables clipping.
    #[arg(long = "clip_norm", default_value_t = 0.0)]
    pub clip_norm: f32,

    /// Bytes reserved for gathering stats payloads from workers.
    #[arg(long = "all_gather_list_size", default_value_t = 1_048_576)]
    pub all_gather_list_size: usize,

    /// Total number of workers across the run.
    #[arg(long = "distributed_world_size", default_value = "1")]
    pub distributed_world_size: NonZeroUsize,

    /// Rank of the launching worker; remaining ranks are derived.
    #[arg(long = "distributed_rank", default_value_t = 0)]
    pub distributed_rank: usize,

    /// Collective transport backend.
    #[arg(long = "distributed_backend", default_value = "thread")]
    pub distributed_backend: String,

    /// Rendezvous address used to establish the initial connection.
    #[arg(long = "distributed_init_method")]
    pub distributed_init_method: Option<String>,

    /// Rendezvous port.
    #[arg(long = "distributed_port", default_value_t = 12355)]
    pub distributed_port: u16,

    /// Which device the launching worker binds.
    #[arg(long = "device_id", default_value_t = 0)]
    pub device_id: usize,

    /// Bucket size (MiB) for gradient reduction batching.
    #[arg(long = "bucket_cap_mb", default_value_t = 25)]
    pub bucket_cap_mb: usize,

    /// Detect parameters that receive no gradient.
    #[arg(long = "find_unused_parameters")]
    pub find_unused_parameters: bool,

    /// Copy non-trainable buffers between workers each step.
    #[arg(long = "broadcast_buffers")]
    pub broadcast_buffers: bool,

    /// Kill the run if no update progress is made within N seconds; -1
    /// disables the watchdog.
    #[arg(
        long = "heartbeat_timeout",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub heartbeat_timeout: i64,

    /// Directory checkpoints are written to.
    #[arg(long = "save_dir", default_value = "checkpoints")]
    pub save_dir: PathBuf,

    /// Save a checkpoint every N epochs.
    #[arg(long = "save_interval", default_value = "1")]
    pub save_interval: NonZeroU64,

    /// Leave the optimizer state out of checkpoints.
    #[arg(long = "no_save_optimizer_state")]
    pub no_save_optimizer_state: bool,

    /// Load checkpoints on every data-parallel rank instead of reading on
    /// rank 0 and broadcasting.
    #[arg(long = "load_checkpoint_on_all_dp_ranks")]
    pub load_checkpoint_on_all_dp_ranks: bool,

    /// Log mid-epoch stats every N updates.
    #[arg(long = "log_interval", default_value_t = 50)]
    pub log_interval: u64,

    /// Dashboard project; unset leaves the dashboard sink unconfigured.
    #[arg(long = "wandb_project")]
    pub wandb_project: Option<String>,

    /// Dashboard entity.
    #[arg(long = "wandb_entity")]
    pub wandb_entity: Option<String>,
}

impl TrainArgs {
    pub fn distributed_config(&self) -> DistributedConfig {
        DistributedConfig {
            world_size: self.distributed_world_size,
            backend: self.distributed_backend.clone(),
            init_method: self.distributed_init_method.clone(),
            port: self.distributed_port,
        }
    }

    pub fn checkpoint_config(&self) -> CheckpointConfig {
        CheckpointConfig {
            save_dir: self.save_dir.clone(),
            save_interval: self.save_interval,
            save_optimizer_state: !self.no_save_optimizer_state,
            load_on_all_ranks: self.load_checkpoint_on_all_dp_ranks,
            save_on_all_ranks: false,
        }
    }

    pub fn adam_config(&self) -> AdamConfig {
        AdamConfig {
            lr: self.lr,
            beta1: self.adam_betas.0,
            beta2: self.adam_betas.1,
            eps: self.adam_eps,
            weight_decay: self.weight_decay,
        }
    }

    pub fn schedule(&self) -> FixedSchedule {
        FixedSchedule::new(self.lr, self.lr_shrink, self.warmup_updates, self.force_anneal)
    }

    pub fn heartbeat_window(&self) -> Option<Duration> {
        u64::try_from(self.heartbeat_timeout)
            .ok()
            .filter(|&secs| secs > 0)
            .map(Duration::from_secs)
    }

    /// Run name for dashboard sinks: `WANDB_NAME`, else the save-dir
    /// basename, else the student number.
    pub fn run_name(&self) -> String {
        if let Ok(name) = std::env::var("WANDB_NAME") {
            if !name.is_empty() {
                return name;
            }
        }
        self.save_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.student_number.clone())
    }
}

fn parse_adam_betas(raw: &str) -> Result<(f32, f32), String> {
    let trimmed = raw
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')');
    let mut parts = trimmed.split(',').map(str::trim);

    let beta = |part: Option<&str>| -> Result<f32, String> {
        part.ok_or_else(|| format!("expected \"(b1, b2)\", got {raw:?}"))?
            .parse()
            .map_err(|e| format!("bad beta in {raw:?}: {e}"))
    };

    let b1 = beta(parts.next())?;
    let b2 = beta(parts.next())?;
    if parts.next().is_some() {
        return Err(format!("expected exactly two betas, got {raw:?}"));
    }
    Ok((b1, b2))
}
