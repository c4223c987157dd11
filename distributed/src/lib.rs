//! Rank/world-size identity and in-process collective primitives.
//!
//! One logical run is split across `world_size` workers, each driven by the
//! same body function. Workers synchronize only at explicit collective calls
//! (barrier, all_gather, all_reduce, broadcast); everything else is private
//! per-worker state.

mod error;
mod group;
mod heartbeat;

use std::num::NonZeroUsize;

pub use error::{CommError, Result};
pub use group::Coordinator;
pub use heartbeat::Heartbeat;

use std::sync::Arc;

use group::WorkerGroup;

/// How a run is distributed. The backend/init-method/port knobs describe the
/// transport; the in-process transport only needs `world_size` but keeps the
/// full surface so launch configs stay portable.
#[derive(Debug, Clone)]
pub struct DistributedConfig {
    pub world_size: NonZeroUsize,
    pub backend: String,
    pub init_method: Option<String>,
    pub port: u16,
}

impl DistributedConfig {
    pub fn single() -> Self {
        Self {
            world_size: NonZeroUsize::MIN,
            backend: "thread".to_string(),
            init_method: None,
            port: 0,
        }
    }
}

/// Entry point for a distributed run.
///
/// With `world_size == 1` the body runs inline on the calling thread. With
/// more workers, one thread per rank is spawned and joined; rank and
/// world-size are established before the body runs.
///
/// Any worker returning an error aborts the whole group: peers blocked in a
/// collective are released with [`CommError::Abandoned`] instead of hanging,
/// and the first error (in rank order) is reported. There is no
/// partial-cluster continuation.
pub fn call_main<T, E, F>(cfg: &DistributedConfig, body: F) -> std::result::Result<Vec<T>, E>
where
    F: Fn(Coordinator) -> std::result::Result<T, E> + Sync,
    T: Send,
    E: Send + From<CommError>,
{
    let world_size = cfg.world_size.get();
    if world_size == 1 {
        return Ok(vec![body(Coordinator::solo())?]);
    }

    log::info!(
        "spawning {world_size} workers (backend {}, init {})",
        cfg.backend,
        cfg.init_method.as_deref().unwrap_or("local"),
    );

    let group = Arc::new(WorkerGroup::new(world_size));
    let body = &body;

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(world_size);
        for rank in 0..world_size {
            let coordinator = Coordinator::new(rank, world_size, group.clone());
            let group_for_worker = group.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("worker-{rank}"))
                .spawn_scoped(scope, move || {
                    let out = body(coordinator);
                    if out.is_err() {
                        // Release peers blocked in a collective.
                        group_for_worker.abort();
                    }
                    out
                });

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Already-spawned workers would block forever waiting for
                    // the ranks that never started.
                    group.abort();
                    return Err(E::from(CommError::Spawn(e)));
                }
            }
        }

        let mut outputs = Vec::with_capacity(world_size);
        let mut first_err: Option<E> = None;
        for handle in handles {
            match handle.join() {
                Ok(Ok(value)) => outputs.push(value),
                Ok(Err(e)) => {
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(_) => {
                    group.abort();
                    if first_err.is_none() {
                        first_err = Some(E::from(CommError::Abandoned));
                    }
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cfg(world_size: usize) -> DistributedConfig {
        DistributedConfig {
            world_size: NonZeroUsize::new(world_size).unwrap(),
            backend: "thread".to_string(),
            init_method: None,
            port: 0,
        }
    }

    #[test]
    fn single_worker_runs_inline() {
        let ranks = call_main(&cfg(1), |c| {
            assert!(c.is_master());
            Ok::<_, CommError>((c.rank(), c.world_size()))
        })
        .unwrap();
        assert_eq!(ranks, vec![(0, 1)]);
    }

    #[test]
    fn ranks_are_unique_and_master_is_rank_zero() {
        let mut ranks = call_main(&cfg(4), |c| {
            assert_eq!(c.is_master(), c.rank() == 0);
            Ok::<_, CommError>(c.rank())
        })
        .unwrap();
        ranks.sort_unstable();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
    }

    #[test]
    fn barrier_orders_pre_barrier_writes() {
        let arrived = AtomicUsize::new(0);
        call_main(&cfg(3), |c| {
            arrived.fetch_add(1, Ordering::SeqCst);
            c.barrier()?;
            // Every pre-barrier increment is visible after the barrier.
            assert_eq!(arrived.load(Ordering::SeqCst), 3);
            Ok::<_, CommError>(())
        })
        .unwrap();
    }

    #[test]
    fn all_gather_is_rank_ordered() {
        call_main(&cfg(3), |c| {
            let gathered = c.all_gather(&format!("r{}", c.rank()), 1024)?;
            assert_eq!(gathered, vec!["r0", "r1", "r2"]);
            Ok::<_, CommError>(())
        })
        .unwrap();
    }

    #[test]
    fn all_gather_rejects_oversized_payloads() {
        let err = call_main(&cfg(2), |c| {
            c.all_gather(&vec![0u8; 256], 8).map(|_| ())
        })
        .unwrap_err();
        assert!(matches!(err, CommError::PayloadTooLarge { .. }));
    }

    #[test]
    fn oversized_payload_applies_to_solo_runs_too() {
        let c = Coordinator::solo();
        let err = c.all_gather(&vec![0u8; 256], 8).unwrap_err();
        assert!(matches!(err, CommError::PayloadTooLarge { .. }));
    }

    #[test]
    fn all_reduce_mean_averages_across_ranks() {
        call_main(&cfg(2), |c| {
            let mut buf = vec![c.rank() as f32 * 2.0, 10.0];
            c.all_reduce_mean(&mut buf)?;
            assert_eq!(buf, vec![1.0, 10.0]);
            Ok::<_, CommError>(())
        })
        .unwrap();
    }

    #[test]
    fn all_reduce_rounds_do_not_bleed_into_each_other() {
        call_main(&cfg(2), |c| {
            for round in 1..=3 {
                let mut buf = vec![round as f32];
                c.all_reduce_sum(&mut buf)?;
                assert_eq!(buf, vec![round as f32 * 2.0]);
            }
            Ok::<_, CommError>(())
        })
        .unwrap();
    }

    #[test]
    fn broadcast_distributes_the_master_value() {
        call_main(&cfg(3), |c| {
            let value = c.is_master().then_some(41u64);
            let got = c.broadcast(value.as_ref())?;
            assert_eq!(got, 41);
            Ok::<_, CommError>(())
        })
        .unwrap();
    }

    #[test]
    fn failing_worker_releases_blocked_peers() {
        let err = call_main(&cfg(2), |c| {
            if c.rank() == 1 {
                return Err(CommError::MissingBroadcastRoot);
            }
            // Rank 1 never arrives; this must not hang.
            c.barrier()
        })
        .unwrap_err();
        assert!(matches!(
            err,
            CommError::MissingBroadcastRoot | CommError::Abandoned
        ));
    }
}
