use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

type StallAction = Box<dyn Fn() + Send + Sync>;

struct Shared {
    last_progress: Mutex<Instant>,
    timeout: Duration,
    stop: AtomicBool,
    on_stall: StallAction,
}

/// Watchdog over training progress.
///
/// The run calls [`pulse`](Heartbeat::pulse) after every applied update; if
/// no pulse arrives within the timeout window, the watchdog fires once and
/// the run is torn down as fatal. This is the only cancellation mechanism —
/// there is no graceful mid-step cancellation.
pub struct Heartbeat {
    shared: Option<Arc<Shared>>,
}

impl Heartbeat {
    /// No-op heartbeat, used when `heartbeat_timeout` is disabled.
    pub fn disabled() -> Self {
        Self { shared: None }
    }

    /// Spawns the watchdog with the default stall action: one fatal log line,
    /// then process exit.
    pub fn spawn(timeout: Duration) -> Self {
        Self::with_action(timeout, Box::new(|| std::process::exit(1)))
    }

    /// Spawns the watchdog with a custom stall action.
    pub fn with_action(timeout: Duration, on_stall: StallAction) -> Self {
        let shared = Arc::new(Shared {
            last_progress: Mutex::new(Instant::now()),
            timeout,
            stop: AtomicBool::new(false),
            on_stall,
        });

        let watcher = shared.clone();
        let spawned = std::thread::Builder::new()
            .name("heartbeat".into())
            .spawn(move || watch(watcher));
        if let Err(e) = spawned {
            log::warn!("failed to spawn heartbeat watchdog: {e}");
            return Self::disabled();
        }

        Self {
            shared: Some(shared),
        }
    }

    /// Records that the run made progress.
    pub fn pulse(&self) {
        if let Some(shared) = &self.shared {
            *shared.last_progress.lock() = Instant::now();
        }
    }
}

impl Drop for Heartbeat {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.stop.store(true, Ordering::Relaxed);
        }
    }
}

fn watch(shared: Arc<Shared>) {
    let tick = (shared.timeout / 4)
        .clamp(Duration::from_millis(10), Duration::from_secs(1));

    loop {
        std::thread::sleep(tick);
        if shared.stop.load(Ordering::Relaxed) {
            return;
        }

        let idle = shared.last_progress.lock().elapsed();
        if idle > shared.timeout {
            log::error!(
                "no training progress for {idle:?} (heartbeat timeout {:?}); aborting run",
                shared.timeout
            );
            (shared.on_stall)();
            return;
        }
    }
}
