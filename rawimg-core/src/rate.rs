//! Throughput and ETA estimation for progress reporting.

use std::time::{Duration, Instant, SystemTime};

/// Default minimum spacing between progress samples (5 Hz).
pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

// Weight of the newest interval in the moving average.
const SMOOTHING: f64 = 0.3;

/// A point-in-time view of a running transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct ProgressSample {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub timestamp: SystemTime,
    /// Smoothed throughput in bytes per second.
    pub throughput_bps: f64,
    /// `None` until a non-zero rate has been established.
    pub eta: Option<Duration>,
}

impl ProgressSample {
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }
}

/// Average throughput and ETA for `done` of `total` bytes after `elapsed`.
///
/// Throughput is zero when no time has passed; the ETA is only defined for a
/// positive throughput.
pub fn estimate(done: u64, total: u64, elapsed: Duration) -> (f64, Option<Duration>) {
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { done as f64 / secs } else { 0.0 };
    (rate, eta(done, total, rate))
}

/// `None` unless the rate is positive and the remaining time fits a `Duration`.
fn eta(done: u64, total: u64, rate: f64) -> Option<Duration> {
    if rate > 0.0 && rate.is_finite() {
        Duration::try_from_secs_f64(total.saturating_sub(done) as f64 / rate).ok()
    } else {
        None
    }
}

/// Turns cumulative byte counts into rate-limited [`ProgressSample`]s.
///
/// The reported throughput is an exponential moving average of per-interval
/// rates, seeded with the overall average of the first interval, so a slow
/// first chunk does not make the ETA swing wildly.
#[derive(Debug)]
pub struct RateEstimator {
    total: u64,
    started: Instant,
    interval: Duration,
    last: Option<(Instant, u64)>,
    smoothed: Option<f64>,
}

impl RateEstimator {
    pub fn new(total: u64, started: Instant, interval: Duration) -> Self {
        Self {
            total,
            started,
            interval,
            last: None,
            smoothed: None,
        }
    }

    /// Returns a sample if at least one interval has passed since the last one.
    pub fn observe(&mut self, done: u64, now: Instant) -> Option<ProgressSample> {
        let since = match self.last {
            Some((at, _)) => now.saturating_duration_since(at),
            None => now.saturating_duration_since(self.started),
        };
        if since < self.interval {
            return None;
        }
        Some(self.sample(done, now))
    }

    /// Produces a sample regardless of the interval.
    pub fn sample(&mut self, done: u64, now: Instant) -> ProgressSample {
        let rate = match (self.last, self.smoothed) {
            (Some((at, prev_done)), Some(prev_rate)) => {
                let dt = now.saturating_duration_since(at).as_secs_f64();
                if dt > 0.0 {
                    let instant = done.saturating_sub(prev_done) as f64 / dt;
                    SMOOTHING * instant + (1.0 - SMOOTHING) * prev_rate
                } else {
                    prev_rate
                }
            }
            _ => estimate(done, self.total, now.saturating_duration_since(self.started)).0,
        };

        self.last = Some((now, done));
        self.smoothed = Some(rate);

        ProgressSample {
            bytes_done: done,
            bytes_total: self.total,
            timestamp: SystemTime::now(),
            throughput_bps: rate,
            eta: eta(done, self.total, rate),
        }
    }

    /// Final sample of a run. The total is pinned to `done`, since a
    /// decompressing restore only learns its real size at the end.
    pub fn finish(&mut self, done: u64, now: Instant) -> ProgressSample {
        self.total = done;
        self.sample(done, now)
    }
}
