use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::meters::{AverageMeter, LatestMeter};

/// Smoothed stat values keyed by stat name.
pub type Stats = BTreeMap<String, f64>;

#[derive(Debug)]
enum Meter {
    Average(AverageMeter),
    Latest(LatestMeter),
}

impl Meter {
    fn smoothed(&self) -> f64 {
        match self {
            Meter::Average(m) => m.smoothed(),
            Meter::Latest(m) => m.smoothed(),
        }
    }
}

#[derive(Debug, Default)]
struct Context {
    meters: BTreeMap<String, Meter>,
}

struct ActiveEntry {
    name: String,
    root: bool,
}

#[derive(Default)]
struct Inner {
    contexts: BTreeMap<String, Context>,
    active: Vec<ActiveEntry>,
}

/// Accumulation contexts for one worker.
///
/// Every worker owns its own registry; cross-worker combination happens
/// explicitly through collective reduction, never through shared state.
/// Handles are cheap clones of the same underlying registry.
#[derive(Clone, Default)]
pub struct MetricsRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears all contexts and deactivates everything. Called once at worker
    /// start so reused registries never leak state between runs.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.contexts.clear();
        inner.active.clear();
    }

    /// Activates `name` for the lifetime of the returned guard. Scalars
    /// logged while the guard lives land in this context and in every
    /// enclosing active context up to the nearest root.
    pub fn aggregate(&self, name: &str) -> Aggregation {
        self.push(name, false)
    }

    /// Like [`aggregate`](Self::aggregate), but starts a fresh aggregation
    /// tree: enclosing contexts stop receiving values until the guard drops.
    pub fn new_root(&self, name: &str) -> Aggregation {
        self.push(name, true)
    }

    fn push(&self, name: &str, root: bool) -> Aggregation {
        let mut inner = self.inner.lock();
        inner.contexts.entry(name.to_string()).or_default();
        inner.active.push(ActiveEntry {
            name: name.to_string(),
            root,
        });
        Aggregation {
            registry: self.clone(),
            name: name.to_string(),
        }
    }

    fn pop(&self, name: &str) {
        let mut inner = self.inner.lock();
        match inner.active.pop() {
            Some(entry) if entry.name == name => {}
            entry => {
                // Guards drop LIFO; anything else is a misuse worth noticing.
                log::warn!(
                    "aggregation guards dropped out of order: expected {name}, got {:?}",
                    entry.map(|e| e.name)
                );
            }
        }
    }

    /// Records a value into the running average for `key` in every active
    /// context up to (and including) the nearest root.
    pub fn log_scalar(&self, key: &str, value: f64, weight: f64) {
        self.fan_out(key, |meter| match meter {
            Meter::Average(m) => m.update(value, weight),
            Meter::Latest(m) => m.update(value),
        })
    }

    /// Records a most-recent value (counters: update count, learning rate).
    pub fn log_latest(&self, key: &str, value: f64) {
        let mut inner = self.inner.lock();
        let names = active_fan_out(&inner.active);
        for name in names {
            let ctx = inner.contexts.entry(name).or_default();
            let meter = ctx
                .meters
                .entry(key.to_string())
                .or_insert_with(|| Meter::Latest(LatestMeter::default()));
            if let Meter::Latest(m) = meter {
                m.update(value);
            }
        }
    }

    fn fan_out(&self, key: &str, mut update: impl FnMut(&mut Meter)) {
        let mut inner = self.inner.lock();
        let names = active_fan_out(&inner.active);
        for name in names {
            let ctx = inner.contexts.entry(name).or_default();
            let meter = ctx
                .meters
                .entry(key.to_string())
                .or_insert_with(|| Meter::Average(AverageMeter::default()));
            update(meter);
        }
    }

    /// Smoothed values for one context. Unknown or empty contexts yield an
    /// empty map rather than an error.
    pub fn get_smoothed_values(&self, name: &str) -> Stats {
        let inner = self.inner.lock();
        match inner.contexts.get(name) {
            Some(ctx) => ctx
                .meters
                .iter()
                .map(|(k, m)| (k.clone(), m.smoothed()))
                .collect(),
            None => Stats::new(),
        }
    }

    /// Clears the accumulators of exactly one context, leaving every other
    /// context untouched.
    pub fn reset_meters(&self, name: &str) {
        let mut inner = self.inner.lock();
        if let Some(ctx) = inner.contexts.get_mut(name) {
            ctx.meters.clear();
        }
    }
}

/// Names that should receive a logged value: the active stack from the top
/// down to the nearest root marker, inclusive.
fn active_fan_out(active: &[ActiveEntry]) -> Vec<String> {
    let mut names = Vec::new();
    for entry in active.iter().rev() {
        names.push(entry.name.clone());
        if entry.root {
            break;
        }
    }
    names
}

/// Guard for an active aggregation context. Values logged while it lives are
/// retained after drop and stay readable via
/// [`MetricsRegistry::get_smoothed_values`].
pub struct Aggregation {
    registry: MetricsRegistry,
    name: String,
}

impl Aggregation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_smoothed_values(&self) -> Stats {
        self.registry.get_smoothed_values(&self.name)
    }
}

impl Drop for Aggregation {
    fn drop(&mut self) {
        self.registry.pop(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nested_contexts_both_receive_values() {
        let reg = MetricsRegistry::new();
        let _outer = reg.aggregate("train");
        {
            let _inner = reg.aggregate("train_inner");
            reg.log_scalar("loss", 2.0, 1.0);
        }
        reg.log_scalar("loss", 4.0, 1.0);

        assert_eq!(reg.get_smoothed_values("train_inner")["loss"], 2.0);
        assert_eq!(reg.get_smoothed_values("train")["loss"], 3.0);
    }

    #[test]
    fn new_root_suspends_enclosing_contexts() {
        let reg = MetricsRegistry::new();
        let _train = reg.aggregate("train");
        {
            let valid = reg.new_root("valid");
            reg.log_scalar("loss", 9.0, 1.0);
            assert_eq!(valid.get_smoothed_values()["loss"], 9.0);
        }
        assert!(reg.get_smoothed_values("train").is_empty());
    }

    #[test]
    fn reset_meters_isolates_contexts() {
        let reg = MetricsRegistry::new();
        {
            let _train = reg.aggregate("train");
            let _inner = reg.aggregate("train_inner");
            reg.log_scalar("loss", 1.5, 2.0);
        }

        let before = reg.get_smoothed_values("train");
        reg.reset_meters("train_inner");

        // Previously retrieved values and the sibling context are unaffected.
        assert_eq!(before["loss"], 1.5);
        assert_eq!(reg.get_smoothed_values("train")["loss"], 1.5);
        assert!(reg.get_smoothed_values("train_inner").is_empty());
    }

    #[test]
    fn values_survive_guard_drop() {
        let reg = MetricsRegistry::new();
        {
            let _g = reg.aggregate("train");
            reg.log_scalar("loss", 1.0, 1.0);
        }
        assert_eq!(reg.get_smoothed_values("train")["loss"], 1.0);
    }

    #[test]
    fn unknown_context_yields_empty_map() {
        let reg = MetricsRegistry::new();
        assert!(reg.get_smoothed_values("nope").is_empty());
    }

    #[test]
    fn latest_meter_not_averaged() {
        let reg = MetricsRegistry::new();
        let _g = reg.aggregate("train");
        reg.log_latest("num_updates", 10.0);
        reg.log_latest("num_updates", 20.0);
        assert_eq!(reg.get_smoothed_values("train")["num_updates"], 20.0);
    }

    #[test]
    fn reactivating_a_context_keeps_accumulating() {
        let reg = MetricsRegistry::new();
        {
            let _g = reg.aggregate("train");
            reg.log_scalar("loss", 2.0, 1.0);
        }
        {
            let _g = reg.aggregate("train");
            reg.log_scalar("loss", 4.0, 1.0);
        }
        assert_eq!(reg.get_smoothed_values("train")["loss"], 3.0);
    }

    #[test]
    fn reset_clears_everything() {
        let reg = MetricsRegistry::new();
        {
            let _g = reg.aggregate("train");
            reg.log_scalar("loss", 2.0, 1.0);
        }
        reg.reset();
        assert!(reg.get_smoothed_values("train").is_empty());
    }
}
