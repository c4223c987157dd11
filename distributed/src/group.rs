use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{CommError, Result};

struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Shared collective state for one group of in-process workers.
///
/// The barrier is the only ordering primitive; gather/reduce piggyback on it
/// with rank-indexed slots.
pub(crate) struct WorkerGroup {
    world_size: usize,
    barrier: Mutex<BarrierState>,
    released: Condvar,
    slots: Mutex<Vec<Vec<u8>>>,
    float_slots: Mutex<Vec<Vec<f32>>>,
}

impl WorkerGroup {
    pub(crate) fn new(world_size: usize) -> Self {
        assert!(world_size > 1, "a group needs at least two workers");
        Self {
            world_size,
            barrier: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
            slots: Mutex::new(vec![Vec::new(); world_size]),
            float_slots: Mutex::new(vec![Vec::new(); world_size]),
        }
    }

    /// Blocks until all workers arrive. The last worker to arrive runs
    /// `on_release` before anyone is woken, which gives collectives a spot to
    /// clean shared buffers without racing the next round.
    pub(crate) fn sync(&self, on_release: impl FnOnce()) -> Result<()> {
        let mut state = self.barrier.lock();
        if state.aborted {
            return Err(CommError::Abandoned);
        }

        state.arrived += 1;
        if state.arrived == self.world_size {
            on_release();
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }

        let generation = state.generation;
        while state.generation == generation && !state.aborted {
            self.released.wait(&mut state);
        }

        if state.aborted {
            Err(CommError::Abandoned)
        } else {
            Ok(())
        }
    }

    /// Marks the group dead and releases every blocked waiter with
    /// `CommError::Abandoned`.
    pub(crate) fn abort(&self) {
        let mut state = self.barrier.lock();
        state.aborted = true;
        self.released.notify_all();
    }

    pub(crate) fn all_gather<T>(&self, rank: usize, value: &T, buffer_size: usize) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        let bytes = serde_json::to_vec(value)?;
        if bytes.len() > buffer_size {
            return Err(CommError::PayloadTooLarge {
                len: bytes.len(),
                capacity: buffer_size,
            });
        }

        self.slots.lock()[rank] = bytes;
        self.sync(|| {})?;

        let gathered = {
            let slots = self.slots.lock();
            slots
                .iter()
                .map(|bytes| serde_json::from_slice(bytes))
                .collect::<std::result::Result<Vec<T>, _>>()?
        };

        // Hold everyone until the slowest reader is done with the slots.
        self.sync(|| {})?;
        Ok(gathered)
    }

    pub(crate) fn all_reduce_sum(&self, rank: usize, buf: &mut [f32]) -> Result<()> {
        self.float_slots.lock()[rank] = buf.to_vec();
        self.sync(|| {})?;

        // Every rank sums the slots in rank order, which keeps the float
        // reduction bit-identical regardless of arrival order.
        {
            let slots = self.float_slots.lock();
            for slot in slots.iter() {
                if slot.len() != buf.len() {
                    return Err(CommError::ShapeMismatch {
                        got: slot.len(),
                        expected: buf.len(),
                    });
                }
            }

            buf.fill(0.0);
            for slot in slots.iter() {
                for (acc, x) in buf.iter_mut().zip(slot) {
                    *acc += x;
                }
            }
        }

        // All readers are done once this releases; the last arriver frees
        // the slots before anyone can start the next round.
        self.sync(|| {
            for slot in self.float_slots.lock().iter_mut() {
                slot.clear();
            }
        })?;
        Ok(())
    }

    pub(crate) fn broadcast_bytes(&self, rank: usize, bytes: Option<Vec<u8>>) -> Result<Vec<u8>> {
        if rank == 0 {
            self.slots.lock()[0] = bytes.ok_or(CommError::MissingBroadcastRoot)?;
        }
        self.sync(|| {})?;
        let received = self.slots.lock()[0].clone();
        self.sync(|| {})?;
        Ok(received)
    }
}

/// One worker's handle onto the run: identity plus collective operations.
///
/// Values are combined across workers only through these explicit calls;
/// nothing is shared implicitly.
#[derive(Clone)]
pub struct Coordinator {
    rank: usize,
    world_size: usize,
    group: Option<Arc<WorkerGroup>>,
}

impl Coordinator {
    /// A single-worker coordinator. Collectives degenerate to local no-ops
    /// but keep their error contracts (payload limits still apply).
    pub fn solo() -> Self {
        Self {
            rank: 0,
            world_size: 1,
            group: None,
        }
    }

    pub(crate) fn new(rank: usize, world_size: usize, group: Arc<WorkerGroup>) -> Self {
        Self {
            rank,
            world_size,
            group: Some(group),
        }
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn world_size(&self) -> usize {
        self.world_size
    }

    /// The rank-0 worker is authoritative for side effects that must not be
    /// duplicated: checkpoint writes, directory verification, dashboards.
    pub fn is_master(&self) -> bool {
        self.rank == 0
    }

    /// Total-order cut point: nobody proceeds until everybody arrived.
    pub fn barrier(&self) -> Result<()> {
        match &self.group {
            Some(group) => group.sync(|| {}),
            None => Ok(()),
        }
    }

    /// Collects `value` from every worker into a rank-ordered vector.
    ///
    /// `buffer_size` bounds each worker's serialized payload; exceeding it is
    /// the typed [`CommError::PayloadTooLarge`], never a truncation.
    pub fn all_gather<T>(&self, value: &T, buffer_size: usize) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.group {
            Some(group) => group.all_gather(self.rank, value, buffer_size),
            None => {
                let bytes = serde_json::to_vec(value)?;
                if bytes.len() > buffer_size {
                    return Err(CommError::PayloadTooLarge {
                        len: bytes.len(),
                        capacity: buffer_size,
                    });
                }
                Ok(vec![serde_json::from_slice(&bytes)?])
            }
        }
    }

    /// Element-wise sum of `buf` across all workers, written back in place.
    /// Deterministic: the reduction always folds in rank order.
    pub fn all_reduce_sum(&self, buf: &mut [f32]) -> Result<()> {
        match &self.group {
            Some(group) => group.all_reduce_sum(self.rank, buf),
            None => Ok(()),
        }
    }

    /// Element-wise mean of `buf` across all workers, written back in place.
    pub fn all_reduce_mean(&self, buf: &mut [f32]) -> Result<()> {
        self.all_reduce_sum(buf)?;
        let scale = 1.0 / self.world_size as f32;
        for x in buf.iter_mut() {
            *x *= scale;
        }
        Ok(())
    }

    /// Distributes a value from rank 0 to every worker. The master must pass
    /// `Some`; other ranks pass `None` and receive the master's value.
    pub fn broadcast<T>(&self, value: Option<&T>) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        match &self.group {
            Some(group) => {
                let bytes = match (self.rank, value) {
                    (0, Some(v)) => Some(serde_json::to_vec(v)?),
                    (0, None) => None,
                    _ => None,
                };
                let received = group.broadcast_bytes(self.rank, bytes)?;
                Ok(serde_json::from_slice(&received)?)
            }
            None => {
                let v = value.ok_or(CommError::MissingBroadcastRoot)?;
                Ok(serde_json::from_slice(&serde_json::to_vec(v)?)?)
            }
        }
    }
}
