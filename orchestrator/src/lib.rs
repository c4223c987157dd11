//! The training-run orchestration engine: composes the metrics registry,
//! distributed coordinator, checkpoint manager, progress reporter, and
//! trainer into the epoch loop.

pub mod args;
mod error;
mod trainer;

use std::time::Duration;

use checkpoint::CheckpointManager;
use distributed::{Coordinator, Heartbeat};
use log::{debug, info};
use metrics::{MetricsRegistry, Stats, StopwatchMeter};
use ml::{DataLoader, Dataset, ModelSpec, Registry};
use progress::{ConsoleSink, DashboardSink, JsonSink, ProgressReporter};
use rand::SeedableRng;
use rand::rngs::StdRng;

pub use args::TrainArgs;
pub use error::{Result, TrainError};
pub use trainer::{StepOutput, Trainer, TrainerConfig};

/// The logical training session: counters that survive checkpoint reload.
///
/// Threaded by reference through the run — never ambient state — so
/// concurrent runs (and tests) stay isolated.
#[derive(Debug, Clone, Copy)]
pub struct RunStatus {
    /// 1-based; the epoch currently being trained.
    pub epoch: u64,
    pub num_updates: u64,
    pub best_score: Option<f64>,
    pub seed: u64,
}

/// What a finished worker reports back.
#[derive(Debug, Clone, Copy)]
pub struct RunSummary {
    pub epochs_done: u64,
    pub num_updates: u64,
    pub best_score: Option<f64>,
    pub wall: Duration,
}

/// Runs the full training session, spawning workers per the distributed
/// configuration. One summary per rank, rank-ordered.
pub fn cli_main(args: &TrainArgs) -> Result<Vec<RunSummary>> {
    distributed::call_main(&args.distributed_config(), |coordinator| {
        run_worker(args, coordinator)
    })
}

/// One worker's whole lifetime: setup, resume, epoch loop, teardown.
fn run_worker(args: &TrainArgs, coordinator: Coordinator) -> Result<RunSummary> {
    let metrics = MetricsRegistry::new();
    metrics.reset();

    if coordinator.is_master() {
        info!("{args:?}");
    }

    let manager = CheckpointManager::new(args.checkpoint_config());
    if coordinator.is_master() {
        manager.verify_checkpoint_directory()?;
    }
    // Nobody trains against an unverified save directory.
    coordinator.barrier()?;

    let (mut train_loader, mut valid_loader, spec) = build_loaders(args, &coordinator)?;

    let registry = Registry::builtin();
    let model = registry.build_model(&args.model, &spec)?;
    let criterion = registry.build_criterion(&args.criterion)?;
    info!("model: {} ({} parameters)", model.name(), model.num_params());
    info!("criterion: {}", criterion.name());

    let mut init_rng = StdRng::seed_from_u64(args.seed);
    let mut trainer = Trainer::new(
        model,
        criterion,
        args.adam_config(),
        args.schedule(),
        coordinator.clone(),
        TrainerConfig {
            clip_norm: args.clip_norm,
            all_gather_buffer: args.all_gather_list_size,
        },
        &mut init_rng,
    );

    let mut run = RunStatus {
        epoch: 1,
        num_updates: 0,
        best_score: None,
        seed: args.seed,
    };

    // A populated save directory means resumption was requested; failures
    // there are fatal rather than silently starting over.
    match manager.load_latest(&coordinator)? {
        Some(snapshot) => {
            trainer.restore(&snapshot)?;
            run.epoch = snapshot.epoch + 1;
            run.num_updates = snapshot.num_updates;
            run.best_score = snapshot.best_score;
            info!(
                "resumed at epoch {} ({} updates, best score {:?})",
                run.epoch, run.num_updates, run.best_score
            );
        }
        None => info!(
            "no checkpoint under {}; starting fresh",
            manager.save_dir().display()
        ),
    }

    let heartbeat = match args.heartbeat_window() {
        Some(window) => Heartbeat::spawn(window),
        None => Heartbeat::disabled(),
    };

    info!("training on {} worker(s)", coordinator.world_size());
    let mut wall = StopwatchMeter::new();
    wall.start();

    while run.epoch <= args.max_epoch {
        train_one_epoch(
            args,
            &coordinator,
            &metrics,
            &mut trainer,
            &mut train_loader,
            &heartbeat,
            &wall,
            run.epoch,
        )?;

        let valid_score = validate(
            args,
            &coordinator,
            &metrics,
            &mut trainer,
            &mut valid_loader,
            &mut run,
            &wall,
        )?;

        // Checkpoint writes are fenced: every rank is done validating before
        // the master writes, and nobody starts the next epoch before the
        // write is visible.
        coordinator.barrier()?;
        run.num_updates = trainer.num_updates();
        manager.save(&coordinator, &trainer.snapshot(&run), valid_score)?;
        coordinator.barrier()?;

        let lr = trainer.lr_step(run.epoch, valid_score);
        debug!("epoch {} complete, lr {lr}", run.epoch);
        run.epoch += 1;
    }

    wall.stop();
    info!("done training in {:.1} seconds", wall.sum().as_secs_f64());

    Ok(RunSummary {
        epochs_done: args.max_epoch,
        num_updates: trainer.num_updates(),
        best_score: run.best_score,
        wall: wall.sum(),
    })
}

/// Loads the dataset, splits off validation, and shards both for this rank.
///
/// Every rank seeds the split identically, so all workers agree on the
/// partition without communicating.
fn build_loaders(
    args: &TrainArgs,
    coordinator: &Coordinator,
) -> Result<(DataLoader, DataLoader, ModelSpec)> {
    let dataset = Dataset::from_path(&args.data_path)?;
    let spec = ModelSpec {
        feature_dim: dataset.feature_dim(),
        target_dim: dataset.target_dim(),
        hidden_dim: args.hidden_dim,
    };
    info!(
        "loaded {} samples ({} features, {} tasks) from {}",
        dataset.len(),
        spec.feature_dim,
        spec.target_dim,
        args.data_path.display()
    );

    let mut split_rng = StdRng::seed_from_u64(args.seed);
    let (train_set, valid_set) = dataset.split_valid(args.valid_percent, &mut split_rng);
    let (rank, world_size) = (coordinator.rank(), coordinator.world_size());

    let train_total = train_set.len();
    let train_shard = train_set.shard(rank, world_size)?;
    let train_loader = DataLoader::new(train_shard, args.batch_size, train_total, world_size);

    // Validation has no per-step collectives, so empty shards are fine.
    let valid_total = valid_set.len();
    let valid_shard = valid_set.slice_rows(ml::shard_range(valid_total, rank, world_size));
    let valid_loader = DataLoader::new(valid_shard, args.batch_size, valid_total, world_size);

    debug!(
        "rank {rank}: {} train / {} valid samples local",
        train_loader.shard_len(),
        valid_loader.shard_len()
    );

    Ok((train_loader, valid_loader, spec))
}

#[allow(clippy::too_many_arguments)]
fn train_one_epoch(
    args: &TrainArgs,
    coordinator: &Coordinator,
    metrics: &MetricsRegistry,
    trainer: &mut Trainer,
    loader: &mut DataLoader,
    heartbeat: &Heartbeat,
    wall: &StopwatchMeter,
    epoch: u64,
) -> Result<()> {
    let _train = metrics.aggregate("train");
    let mut progress = build_progress(args, coordinator, epoch, Some(loader.num_batches()))?;

    trainer.begin_epoch(epoch);
    loader.begin_epoch(&mut epoch_rng(args.seed, epoch));
    info!("start iterating over samples");

    let mut num_updates = trainer.num_updates();
    for batch in progress.wrap(loader.by_ref()) {
        let output = {
            let _inner = metrics.aggregate("train_inner");
            trainer.train_step(&batch, metrics)?
        };

        // A skipped step (overflow on some rank) is not a logged step.
        if output.is_some() {
            heartbeat.pulse();
            num_updates = trainer.num_updates();
            if args.log_interval > 0 && num_updates % args.log_interval == 0 {
                let stats = training_stats(metrics.get_smoothed_values("train_inner"), wall);
                progress.log(&stats, "train_inner", num_updates);
                // Mid-epoch meters restart each interval; the epoch-level
                // "train" context keeps accumulating.
                metrics.reset_meters("train_inner");
            }
        }
    }

    info!("end of epoch {epoch} (average epoch stats below)");
    let stats = training_stats(metrics.get_smoothed_values("train"), wall);
    progress.print(&stats, "train", num_updates);
    metrics.reset_meters("train");
    Ok(())
}

/// Evaluates the model on the validation split and returns the run score.
fn validate(
    args: &TrainArgs,
    coordinator: &Coordinator,
    metrics: &MetricsRegistry,
    trainer: &mut Trainer,
    loader: &mut DataLoader,
    run: &mut RunStatus,
    wall: &StopwatchMeter,
) -> Result<Option<f64>> {
    trainer.begin_valid_epoch(run.epoch);
    info!(
        "begin validation on \"{:.1}-validation\" subset",
        args.valid_percent
    );

    let mut progress = build_progress(args, coordinator, run.epoch, Some(loader.num_batches()))?;
    loader.begin_epoch(&mut epoch_rng(args.seed, run.epoch));

    let aggregation = metrics.new_root("valid");
    for batch in progress.wrap(loader.by_ref()) {
        trainer.valid_step(&batch, metrics);
    }
    let mut stats = aggregation.get_smoothed_values();
    drop(aggregation);

    let score = trainer.end_valid_epoch()?;
    stats.insert("num_updates".to_string(), trainer.num_updates() as f64);
    if let Some(auroc) = score {
        let best = get_valid_stats(run, auroc);
        stats.insert("auroc".to_string(), auroc);
        stats.insert("best_auroc".to_string(), best);
    }
    let stats = training_stats(stats, wall);

    progress.print(&stats, "valid", trainer.num_updates());
    metrics.reset_meters("valid");
    Ok(score)
}

/// Folds a validation score into the run's best, which only ever improves.
/// Returns the updated best.
pub fn get_valid_stats(run: &mut RunStatus, auroc: f64) -> f64 {
    let best = run.best_score.map_or(auroc, |prev| prev.max(auroc));
    run.best_score = Some(best);
    best
}

fn training_stats(mut stats: Stats, wall: &StopwatchMeter) -> Stats {
    stats.insert("wall".to_string(), wall.sum().as_secs_f64().round());
    stats
}

/// The epoch's data-order RNG: a pure function of `(seed, epoch)`, so a
/// resumed run replays exactly the stream a fresh run would have produced.
fn epoch_rng(seed: u64, epoch: u64) -> StdRng {
    StdRng::seed_from_u64(seed.wrapping_add(epoch.wrapping_mul(0x9e37_79b9)))
}

/// Console everywhere; JSON and dashboard records from the master only.
/// An unconfigured dashboard project means no dashboard sink, not an error.
fn build_progress(
    args: &TrainArgs,
    coordinator: &Coordinator,
    epoch: u64,
    total: Option<usize>,
) -> Result<ProgressReporter> {
    let mut reporter = ProgressReporter::new(epoch, total).with_sink(Box::new(ConsoleSink));

    if coordinator.is_master() {
        reporter = reporter.with_sink(Box::new(JsonSink));
        if let Some(project) = &args.wandb_project {
            let sink = DashboardSink::create(
                project,
                args.wandb_entity.as_deref(),
                &args.run_name(),
                &args.save_dir,
            )?;
            reporter = reporter.with_sink(Box::new(sink));
        }
    }

    Ok(reporter)
}
