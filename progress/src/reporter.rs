use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::sink::{Record, Sink};

/// Tracks a position through a batch source and fans stats out to sinks.
///
/// The reporter never emits on its own: `log` fires only when called, so
/// call sites own the cadence, and `print` is the unconditional end-of-epoch
/// summary. It reads training state but never mutates it.
pub struct ProgressReporter {
    epoch: u64,
    total: Option<usize>,
    position: Arc<AtomicUsize>,
    sinks: Vec<Box<dyn Sink>>,
}

impl ProgressReporter {
    pub fn new(epoch: u64, total: Option<usize>) -> Self {
        Self {
            epoch,
            total,
            position: Arc::new(AtomicUsize::new(0)),
            sinks: Vec::new(),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Batches yielded so far this epoch.
    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    /// Wraps a batch source; yielding a batch advances the position counter.
    /// The wrapper holds no reporter borrow, so stats can be logged from
    /// inside the iteration.
    pub fn wrap<I>(&self, inner: I) -> Tracked<I> {
        Tracked {
            inner,
            position: self.position.clone(),
        }
    }

    /// Emits a mid-epoch stats sample to every sink.
    pub fn log(&mut self, stats: &BTreeMap<String, f64>, tag: &str, step: u64) {
        self.emit(stats, tag, step, false);
    }

    /// Emits an end-of-epoch summary, regardless of any logging interval.
    pub fn print(&mut self, stats: &BTreeMap<String, f64>, tag: &str, step: u64) {
        self.emit(stats, tag, step, true);
    }

    fn emit(&mut self, stats: &BTreeMap<String, f64>, tag: &str, step: u64, summary: bool) {
        let record = Record {
            epoch: self.epoch,
            tag,
            step,
            position: self.position(),
            total: self.total,
            stats,
            summary,
        };
        for sink in &mut self.sinks {
            sink.emit(&record);
        }
    }
}

/// Iterator wrapper produced by [`ProgressReporter::wrap`].
pub struct Tracked<I> {
    inner: I,
    position: Arc<AtomicUsize>,
}

impl<I: Iterator> Iterator for Tracked<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.inner.next();
        if item.is_some() {
            self.position.fetch_add(1, Ordering::Relaxed);
        }
        item
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}
