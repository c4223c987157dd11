use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use rand::Rng;
use rand::rngs::StdRng;

use crate::error::{MlError, Result};

/// In-memory feature/label matrix, row-major.
///
/// Targets are per-task binary labels in `{0, 1}`; a negative value marks the
/// task as inactive for that sample and is excluded from loss and scoring.
#[derive(Debug, Clone)]
pub struct Dataset {
    feature_dim: usize,
    target_dim: usize,
    features: Vec<f32>,
    targets: Vec<f32>,
}

/// On-disk layout produced by the (external) preprocessing step.
#[derive(serde::Serialize, serde::Deserialize)]
struct DatasetFile {
    feature_dim: usize,
    target_dim: usize,
    features: Vec<f32>,
    targets: Vec<f32>,
}

impl Dataset {
    pub fn from_parts(
        feature_dim: usize,
        target_dim: usize,
        features: Vec<f32>,
        targets: Vec<f32>,
    ) -> Result<Self> {
        let check = |what, len: usize, dim: usize| {
            if dim == 0 || len % dim != 0 {
                Err(MlError::SizeMismatch {
                    what,
                    got: len,
                    expected: dim.max(1),
                })
            } else {
                Ok(len / dim)
            }
        };

        let rows = check("features", features.len(), feature_dim)?;
        let target_rows = check("targets", targets.len(), target_dim)?;
        if rows != target_rows {
            return Err(MlError::SizeMismatch {
                what: "target rows",
                got: target_rows,
                expected: rows,
            });
        }

        Ok(Self {
            feature_dim,
            target_dim,
            features,
            targets,
        })
    }

    /// Loads a preprocessed feature file.
    pub fn from_path(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| MlError::Dataset {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        let raw: DatasetFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| MlError::Dataset {
                path: path.to_path_buf(),
                detail: e.to_string(),
            })?;
        Self::from_parts(raw.feature_dim, raw.target_dim, raw.features, raw.targets)
    }

    /// Writes the on-disk layout; the counterpart of [`from_path`](Self::from_path).
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| MlError::Dataset {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        serde_json::to_writer(
            file,
            &DatasetFile {
                feature_dim: self.feature_dim,
                target_dim: self.target_dim,
                features: self.features.clone(),
                targets: self.targets.clone(),
            },
        )
        .map_err(|e| MlError::Dataset {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        if self.feature_dim == 0 {
            0
        } else {
            self.features.len() / self.feature_dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    pub fn target_dim(&self) -> usize {
        self.target_dim
    }

    pub fn row(&self, index: usize) -> (&[f32], &[f32]) {
        let x = &self.features[index * self.feature_dim..(index + 1) * self.feature_dim];
        let y = &self.targets[index * self.target_dim..(index + 1) * self.target_dim];
        (x, y)
    }

    fn take_rows(&self, indices: &[usize]) -> Self {
        let mut features = Vec::with_capacity(indices.len() * self.feature_dim);
        let mut targets = Vec::with_capacity(indices.len() * self.target_dim);
        for &i in indices {
            let (x, y) = self.row(i);
            features.extend_from_slice(x);
            targets.extend_from_slice(y);
        }
        Self {
            feature_dim: self.feature_dim,
            target_dim: self.target_dim,
            features,
            targets,
        }
    }

    /// Splits off a validation subset of `valid_percent` of the samples.
    ///
    /// The split is drawn with the caller's RNG; seeding it identically on
    /// every worker yields the same split everywhere.
    pub fn split_valid(self, valid_percent: f64, rng: &mut StdRng) -> (Self, Self) {
        let n_valid = ((self.len() as f64) * valid_percent.clamp(0.0, 1.0)).round() as usize;
        if n_valid == 0 {
            let empty = Self {
                feature_dim: self.feature_dim,
                target_dim: self.target_dim,
                features: Vec::new(),
                targets: Vec::new(),
            };
            return (self, empty);
        }

        let mut order: Vec<usize> = (0..self.len()).collect();
        shuffle(&mut order, rng);
        let (valid_idx, train_idx) = order.split_at(n_valid);
        (self.take_rows(train_idx), self.take_rows(valid_idx))
    }

    /// A contiguous sub-range of rows. Unlike [`shard`](Self::shard) this
    /// allows empty results, which validation shards may legitimately be.
    pub fn slice_rows(&self, range: std::ops::Range<usize>) -> Self {
        let indices: Vec<usize> = range.collect();
        self.take_rows(&indices)
    }

    /// The contiguous, balanced shard of this dataset owned by `rank`.
    pub fn shard(&self, rank: usize, world_size: usize) -> Result<Self> {
        if self.len() < world_size {
            return Err(MlError::ShardUnderflow {
                samples: self.len(),
                workers: world_size,
            });
        }
        let range = shard_range(self.len(), rank, world_size);
        let indices: Vec<usize> = range.collect();
        Ok(self.take_rows(&indices))
    }
}

/// Splits `total` samples among `world_size` workers, returning the range
/// owned by `rank`. Ranges are contiguous, disjoint, cover `[0..total)`, and
/// differ in size by at most one.
pub fn shard_range(total: usize, rank: usize, world_size: usize) -> std::ops::Range<usize> {
    assert!(world_size > 0);
    assert!(rank < world_size);

    let base = total / world_size;
    let remainder = total % world_size;
    let start = rank * base + rank.min(remainder);
    let extra = usize::from(rank < remainder);
    start..start + base + extra
}

/// Fisher-Yates over `slice` driven by the run RNG.
pub fn shuffle<T>(slice: &mut [T], rng: &mut StdRng) {
    for i in (1..slice.len()).rev() {
        let j = rng.random_range(0..=i);
        slice.swap(i, j);
    }
}
