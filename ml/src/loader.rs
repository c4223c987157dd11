use std::num::NonZeroUsize;

use rand::rngs::StdRng;

use crate::dataset::{Dataset, shuffle};

/// One materialized batch of samples, row-major like the dataset.
#[derive(Debug, Clone)]
pub struct Batch {
    pub len: usize,
    pub feature_dim: usize,
    pub target_dim: usize,
    pub xs: Vec<f32>,
    pub ys: Vec<f32>,
}

/// Shard-local batch source with a fixed, world-uniform batch count.
///
/// Every rank yields exactly `num_batches` batches per epoch regardless of
/// its shard size (shards differ by at most one sample): a rank that runs
/// out of rows replays its shuffled order from the start. Equal step counts
/// are what keep per-step collectives from deadlocking.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    num_batches: usize,
    order: Vec<usize>,
    cursor: usize,
    yielded: usize,
}

impl DataLoader {
    /// `global_len` is the unsharded dataset size; together with
    /// `world_size` it fixes the batch count every rank must produce.
    pub fn new(
        shard: Dataset,
        batch_size: NonZeroUsize,
        global_len: usize,
        world_size: usize,
    ) -> Self {
        let batch_size = batch_size.get();
        let widest_shard = global_len.div_ceil(world_size.max(1));
        let num_batches = widest_shard.div_ceil(batch_size);
        let order: Vec<usize> = (0..shard.len()).collect();

        Self {
            dataset: shard,
            batch_size,
            num_batches,
            order,
            cursor: 0,
            yielded: num_batches, // exhausted until an epoch begins
        }
    }

    /// Batches every rank yields per epoch.
    pub fn num_batches(&self) -> usize {
        self.num_batches
    }

    pub fn shard_len(&self) -> usize {
        self.dataset.len()
    }

    /// Resets the position and reshuffles the visiting order.
    ///
    /// Callers derive `rng` from `(seed, epoch)`, which makes the batch
    /// stream a pure function of the snapshot — resuming at epoch E replays
    /// exactly the order a fresh run would have used.
    pub fn begin_epoch(&mut self, rng: &mut StdRng) {
        shuffle(&mut self.order, rng);
        self.cursor = 0;
        self.yielded = 0;
    }

    fn next_batch(&mut self) -> Option<Batch> {
        if self.yielded == self.num_batches || self.order.is_empty() {
            return None;
        }

        if self.cursor >= self.order.len() {
            // Shorter shard: replay from the start to pad the epoch.
            self.cursor = 0;
        }

        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];

        let mut batch = Batch {
            len: indices.len(),
            feature_dim: self.dataset.feature_dim(),
            target_dim: self.dataset.target_dim(),
            xs: Vec::with_capacity(indices.len() * self.dataset.feature_dim()),
            ys: Vec::with_capacity(indices.len() * self.dataset.target_dim()),
        };
        for &i in indices {
            let (x, y) = self.dataset.row(i);
            batch.xs.extend_from_slice(x);
            batch.ys.extend_from_slice(y);
        }

        self.cursor = end;
        self.yielded += 1;
        Some(batch)
    }
}

impl Iterator for DataLoader {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        self.next_batch()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.num_batches - self.yielded;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn shard(rows: usize) -> Dataset {
        let features = (0..rows).map(|v| v as f32).collect();
        let targets = vec![0.0; rows];
        Dataset::from_parts(1, 1, features, targets).unwrap()
    }

    #[test]
    fn yields_every_row_once_per_epoch() {
        let mut loader =
            DataLoader::new(shard(6), NonZeroUsize::new(2).unwrap(), 6, 1);
        let mut rng = StdRng::seed_from_u64(0);
        loader.begin_epoch(&mut rng);

        let mut seen: Vec<f32> = loader.by_ref().flat_map(|b| b.xs).collect();
        seen.sort_by(f32::total_cmp);
        assert_eq!(seen, vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
    }

    #[test]
    fn uneven_shards_still_yield_equal_batch_counts() {
        // 5 samples over 2 workers: shards of 3 and 2, both must yield
        // ceil(3/2) = 2 batches.
        let mut short = DataLoader::new(shard(2), NonZeroUsize::new(2).unwrap(), 5, 2);
        let mut long = DataLoader::new(shard(3), NonZeroUsize::new(2).unwrap(), 5, 2);

        let mut rng = StdRng::seed_from_u64(0);
        short.begin_epoch(&mut rng);
        long.begin_epoch(&mut rng);

        assert_eq!(short.num_batches(), 2);
        assert_eq!(short.by_ref().count(), 2);
        assert_eq!(long.by_ref().count(), 2);
    }

    #[test]
    fn exhausted_until_an_epoch_begins() {
        let mut loader =
            DataLoader::new(shard(4), NonZeroUsize::new(2).unwrap(), 4, 1);
        assert!(loader.next().is_none());

        let mut rng = StdRng::seed_from_u64(0);
        loader.begin_epoch(&mut rng);
        assert_eq!(loader.by_ref().count(), 2);
        assert!(loader.next().is_none());
    }

    #[test]
    fn epoch_order_is_a_function_of_the_rng() {
        let make = || DataLoader::new(shard(8), NonZeroUsize::new(3).unwrap(), 8, 1);

        let collect = |loader: &mut DataLoader, seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            loader.begin_epoch(&mut rng);
            loader.by_ref().flat_map(|b| b.xs).collect::<Vec<_>>()
        };

        let (mut a, mut b) = (make(), make());
        assert_eq!(collect(&mut a, 5), collect(&mut b, 5));
        assert_ne!(collect(&mut a, 5), collect(&mut b, 6));
    }
}
