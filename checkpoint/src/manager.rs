use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};

use distributed::Coordinator;
use log::info;

use crate::error::{CheckpointError, Result};
use crate::snapshot::{self, Snapshot};

const BEST_NAME: &str = "checkpoint_best.safetensors";

/// Checkpoint policy for one run.
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    pub save_dir: PathBuf,
    /// Save every N-th epoch; epochs not divisible by N are skipped.
    pub save_interval: NonZeroU64,
    /// Drop the optimizer tensors from saved snapshots.
    pub save_optimizer_state: bool,
    /// Every rank reads from storage instead of rank 0 + broadcast.
    pub load_on_all_ranks: bool,
    /// Every rank writes its own (rank-tagged) snapshot file.
    pub save_on_all_ranks: bool,
}

impl CheckpointConfig {
    pub fn new(save_dir: impl Into<PathBuf>) -> Self {
        Self {
            save_dir: save_dir.into(),
            save_interval: NonZeroU64::MIN,
            save_optimizer_state: true,
            load_on_all_ranks: false,
            save_on_all_ranks: false,
        }
    }
}

/// Persists and restores run snapshots under a single save directory.
///
/// The save directory is the only cross-worker shared mutable resource, so
/// writes are single-writer (master) unless explicitly configured otherwise,
/// and a snapshot becomes visible under its final name only after a rename —
/// an external reader never observes a partially written checkpoint.
pub struct CheckpointManager {
    cfg: CheckpointConfig,
}

impl CheckpointManager {
    pub fn new(cfg: CheckpointConfig) -> Self {
        Self { cfg }
    }

    pub fn save_dir(&self) -> &Path {
        &self.cfg.save_dir
    }

    /// Ensures the destination is writable before any training happens.
    ///
    /// Called by the master ahead of epoch 1 so an unwritable directory fails
    /// the run immediately instead of after an expensive epoch.
    pub fn verify_checkpoint_directory(&self) -> Result<()> {
        let dir = &self.cfg.save_dir;
        let unwritable = |source: std::io::Error| CheckpointError::Unwritable {
            dir: dir.clone(),
            source,
        };

        fs::create_dir_all(dir).map_err(unwritable)?;
        let probe = dir.join(format!(".write-probe-{}", std::process::id()));
        fs::write(&probe, b"probe").map_err(unwritable)?;
        fs::remove_file(&probe).map_err(unwritable)?;
        Ok(())
    }

    /// Saves `snapshot` for its epoch, honoring the save interval, and
    /// refreshes the best alias whenever `valid_score` matches the run's
    /// best — the alias is not gated by the interval.
    ///
    /// Non-master ranks are a no-op unless `save_on_all_ranks` is set.
    /// Returns the epoch checkpoint's path, or `None` when the interval
    /// skips this epoch.
    pub fn save(
        &self,
        coordinator: &Coordinator,
        snapshot: &Snapshot,
        valid_score: Option<f64>,
    ) -> Result<Option<PathBuf>> {
        if !coordinator.is_master() && !self.cfg.save_on_all_ranks {
            return Ok(None);
        }

        let epoch_due = snapshot.epoch % self.cfg.save_interval.get() == 0;
        let is_best = coordinator.is_master()
            && match (valid_score, snapshot.best_score) {
                (Some(score), Some(best)) => score >= best,
                (Some(_), None) => true,
                (None, _) => false,
            };
        if !epoch_due && !is_best {
            return Ok(None);
        }

        let to_write = if self.cfg.save_optimizer_state {
            snapshot.clone()
        } else {
            snapshot.without_optimizer()
        };
        let bytes = snapshot::encode(&to_write)?;

        let mut path = None;
        if epoch_due {
            let name = if coordinator.is_master() {
                format!("checkpoint{}.safetensors", snapshot.epoch)
            } else {
                format!(
                    "checkpoint{}-rank{}.safetensors",
                    snapshot.epoch,
                    coordinator.rank()
                )
            };
            let written = self.write_atomic(&name, &bytes)?;
            info!(
                "saved checkpoint {} (epoch {}, {} updates)",
                written.display(),
                snapshot.epoch,
                snapshot.num_updates
            );
            path = Some(written);
        }

        if is_best {
            self.write_atomic(BEST_NAME, &bytes)?;
            info!(
                "saved new best checkpoint (score {:.4})",
                valid_score.unwrap_or_default()
            );
        }

        Ok(path)
    }

    /// Restores a snapshot from `path`.
    ///
    /// On multi-worker runs only rank 0 reads from storage and the snapshot
    /// is broadcast, avoiding redundant I/O contention — unless
    /// `load_on_all_ranks` makes every rank read directly.
    pub fn load(&self, coordinator: &Coordinator, path: &Path) -> Result<Snapshot> {
        if self.cfg.load_on_all_ranks || coordinator.world_size() == 1 {
            return read_snapshot(path);
        }

        // The read outcome itself is broadcast so every rank fails together
        // instead of leaving peers stuck behind a dead master.
        let local: Option<std::result::Result<Snapshot, String>> = coordinator
            .is_master()
            .then(|| read_snapshot(path).map_err(|e| e.to_string()));
        let shared = coordinator.broadcast(local.as_ref())?;
        shared.map_err(|detail| CheckpointError::Corrupt {
            path: path.to_path_buf(),
            detail,
        })
    }

    /// Restores the most recent epoch snapshot in the save directory, if any.
    pub fn load_latest(&self, coordinator: &Coordinator) -> Result<Option<Snapshot>> {
        match self.last_checkpoint()? {
            Some((epoch, path)) => {
                info!("resuming from {} (epoch {epoch})", path.display());
                Ok(Some(self.load(coordinator, &path)?))
            }
            None => Ok(None),
        }
    }

    /// The highest epoch-tagged checkpoint under the save directory.
    pub fn last_checkpoint(&self) -> Result<Option<(u64, PathBuf)>> {
        let dir = &self.cfg.save_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CheckpointError::Io {
                    path: dir.clone(),
                    source: e,
                });
            }
        };

        let mut latest: Option<(u64, PathBuf)> = None;
        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::Io {
                path: dir.clone(),
                source: e,
            })?;
            let name = entry.file_name();
            let Some(epoch) = parse_epoch(&name.to_string_lossy()) else {
                continue;
            };
            if latest.as_ref().is_none_or(|(e, _)| epoch > *e) {
                latest = Some((epoch, entry.path()));
            }
        }
        Ok(latest)
    }

    fn write_atomic(&self, final_name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let dir = &self.cfg.save_dir;
        let tmp = dir.join(format!(".tmp.{final_name}"));
        let path = dir.join(final_name);

        fs::write(&tmp, bytes).map_err(|e| CheckpointError::Io {
            path: tmp.clone(),
            source: e,
        })?;
        fs::rename(&tmp, &path).map_err(|e| CheckpointError::Io {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

fn read_snapshot(path: &Path) -> Result<Snapshot> {
    if !path.exists() {
        return Err(CheckpointError::Missing(path.to_path_buf()));
    }
    let bytes = fs::read(path).map_err(|e| CheckpointError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    snapshot::decode(&bytes, path)
}

/// Parses `checkpoint{E}.safetensors` names; the best alias and rank-tagged
/// files are not resume candidates.
fn parse_epoch(name: &str) -> Option<u64> {
    let rest = name.strip_prefix("checkpoint")?;
    let digits = rest.strip_suffix(".safetensors")?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::OptimizerState;

    fn snapshot(epoch: u64) -> Snapshot {
        Snapshot {
            epoch,
            num_updates: epoch * 10,
            best_score: None,
            seed: 1,
            model_params: vec![1.0, 2.0],
            optimizer: Some(OptimizerState {
                exp_avg: vec![0.1, 0.2],
                exp_avg_sq: vec![0.01, 0.02],
                beta1_power: 0.9,
                beta2_power: 0.999,
            }),
        }
    }

    fn manager(dir: &Path) -> CheckpointManager {
        CheckpointManager::new(CheckpointConfig::new(dir))
    }

    #[test]
    fn save_then_load_round_trips_run_state() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let coord = Coordinator::solo();

        let mut snap = snapshot(3);
        snap.best_score = Some(0.75);

        let path = mgr.save(&coord, &snap, Some(0.75)).unwrap().unwrap();
        let loaded = mgr.load(&coord, &path).unwrap();

        assert_eq!(loaded.epoch, snap.epoch);
        assert_eq!(loaded.num_updates, snap.num_updates);
        assert_eq!(loaded.best_score, snap.best_score);
        assert_eq!(loaded, snap);
    }

    #[test]
    fn save_interval_skips_non_multiples() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CheckpointConfig::new(dir.path());
        cfg.save_interval = NonZeroU64::new(2).unwrap();
        let mgr = CheckpointManager::new(cfg);
        let coord = Coordinator::solo();

        assert!(mgr.save(&coord, &snapshot(1), Some(0.5)).unwrap().is_none());
        assert!(mgr.save(&coord, &snapshot(2), Some(0.5)).unwrap().is_some());
        assert!(mgr.save(&coord, &snapshot(3), Some(0.5)).unwrap().is_none());

        assert!(!dir.path().join("checkpoint1.safetensors").exists());
        assert!(dir.path().join("checkpoint2.safetensors").exists());
        assert!(!dir.path().join("checkpoint3.safetensors").exists());
    }

    #[test]
    fn best_alias_tracks_the_best_score_only() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let coord = Coordinator::solo();
        let best = dir.path().join(BEST_NAME);

        // First validated epoch always sets the alias.
        let mut snap = snapshot(1);
        snap.best_score = Some(0.70);
        mgr.save(&coord, &snap, Some(0.70)).unwrap();
        assert!(best.exists());
        let first = mgr.load(&coord, &best).unwrap();

        // A worse epoch keeps the alias pointing at the old snapshot.
        let mut snap = snapshot(2);
        snap.best_score = Some(0.70);
        mgr.save(&coord, &snap, Some(0.65)).unwrap();
        assert_eq!(mgr.load(&coord, &best).unwrap(), first);

        // A better epoch refreshes it.
        let mut snap = snapshot(3);
        snap.best_score = Some(0.80);
        mgr.save(&coord, &snap, Some(0.80)).unwrap();
        assert_eq!(mgr.load(&coord, &best).unwrap().epoch, 3);
    }

    #[test]
    fn best_alias_ignores_the_save_interval() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CheckpointConfig::new(dir.path());
        cfg.save_interval = NonZeroU64::new(5).unwrap();
        let mgr = CheckpointManager::new(cfg);
        let coord = Coordinator::solo();

        // Epoch 1 is skipped by the interval, but it set a new best.
        let mut snap = snapshot(1);
        snap.best_score = Some(0.9);
        assert!(mgr.save(&coord, &snap, Some(0.9)).unwrap().is_none());

        assert!(!dir.path().join("checkpoint1.safetensors").exists());
        assert!(dir.path().join(BEST_NAME).exists());
    }

    #[test]
    fn optimizer_state_can_be_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = CheckpointConfig::new(dir.path());
        cfg.save_optimizer_state = false;
        let mgr = CheckpointManager::new(cfg);
        let coord = Coordinator::solo();

        let path = mgr.save(&coord, &snapshot(1), None).unwrap().unwrap();
        assert_eq!(mgr.load(&coord, &path).unwrap().optimizer, None);
    }

    #[test]
    fn no_temporary_files_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        mgr.save(&Coordinator::solo(), &snapshot(1), Some(0.5))
            .unwrap();

        let stray: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp."))
            .collect();
        assert!(stray.is_empty());
    }

    #[test]
    fn load_of_missing_checkpoint_is_fatal_not_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let err = mgr
            .load(&Coordinator::solo(), &dir.path().join("checkpoint9.safetensors"))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Missing(_)));
    }

    #[test]
    fn load_of_corrupt_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint1.safetensors");
        fs::write(&path, b"garbage").unwrap();

        let err = manager(dir.path())
            .load(&Coordinator::solo(), &path)
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { .. }));
    }

    #[test]
    fn last_checkpoint_picks_highest_epoch_and_ignores_aliases() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path());
        let coord = Coordinator::solo();

        assert!(mgr.last_checkpoint().unwrap().is_none());

        for epoch in [1, 3, 2] {
            let mut snap = snapshot(epoch);
            snap.best_score = Some(0.5);
            mgr.save(&coord, &snap, Some(0.5)).unwrap();
        }

        let (epoch, path) = mgr.last_checkpoint().unwrap().unwrap();
        assert_eq!(epoch, 3);
        assert!(path.ends_with("checkpoint3.safetensors"));
    }

    #[test]
    fn verify_rejects_unwritable_directory() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A plain file where a directory is expected cannot be written into.
        let mgr = manager(file.path());
        assert!(matches!(
            mgr.verify_checkpoint_directory(),
            Err(CheckpointError::Unwritable { .. })
        ));
    }
}
