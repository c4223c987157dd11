use std::time::{Duration, Instant};

/// Weighted running average.
#[derive(Debug, Default, Clone, Copy)]
pub struct AverageMeter {
    sum: f64,
    weight: f64,
}

impl AverageMeter {
    #[inline]
    pub fn update(&mut self, value: f64, weight: f64) {
        self.sum += value * weight;
        self.weight += weight;
    }

    /// The smoothed value, `sum / weight`. Zero weight reads as zero.
    pub fn smoothed(&self) -> f64 {
        if self.weight > 0.0 {
            self.sum / self.weight
        } else {
            0.0
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Keeps only the most recent value. Used for counters such as the update
/// count or the current learning rate, where averaging is meaningless.
#[derive(Debug, Default, Clone, Copy)]
pub struct LatestMeter {
    value: f64,
}

impl LatestMeter {
    #[inline]
    pub fn update(&mut self, value: f64) {
        self.value = value;
    }

    pub fn smoothed(&self) -> f64 {
        self.value
    }
}

/// Accumulates wall-clock time across start/stop intervals.
#[derive(Debug, Default)]
pub struct StopwatchMeter {
    accumulated: Duration,
    started_at: Option<Instant>,
}

impl StopwatchMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    pub fn stop(&mut self) {
        if let Some(at) = self.started_at.take() {
            self.accumulated += at.elapsed();
        }
    }

    /// Total accumulated time, including a currently running interval.
    pub fn sum(&self) -> Duration {
        match self.started_at {
            Some(at) => self.accumulated + at.elapsed(),
            None => self.accumulated,
        }
    }
}
