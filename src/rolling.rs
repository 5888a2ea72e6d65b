//! Trailing time-window mean over an unbounded stream.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::protocol::DEFAULT_ROLLING_WINDOW;

/// Unweighted mean of every value pushed within the last `window`.
///
/// Entries older than `now - window` are evicted on every push; eviction only
/// ever removes from the front, so the retained set is always a time-ordered
/// suffix of what was pushed. Memory is bounded by the push rate times the
/// window, independent of any sample buffer size.
#[derive(Debug, Clone)]
pub struct RollingAverage {
    window: Duration,
    entries: VecDeque<(Instant, f64)>,
}

impl Default for RollingAverage {
    fn default() -> Self {
        Self::new(DEFAULT_ROLLING_WINDOW)
    }
}

impl RollingAverage {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            entries: VecDeque::new(),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Oldest timestamp still inside the window ending at `now`.
    ///
    /// `None` when the window reaches back before the clock's origin, in which
    /// case nothing is old enough to evict.
    fn cutoff(&self, now: Instant) -> Option<Instant> {
        now.checked_sub(self.window)
    }

    pub fn push(&mut self, value: f64) {
        self.push_at(value, Instant::now());
    }

    /// Append `value` stamped `at`, then evict everything older than
    /// `at - window`.
    pub fn push_at(&mut self, value: f64, at: Instant) {
        self.entries.push_back((at, value));
        if let Some(cutoff) = self.cutoff(at) {
            while self.entries.front().is_some_and(|(t, _)| *t < cutoff) {
                self.entries.pop_front();
            }
        }
    }

    pub fn average(&self) -> f64 {
        self.average_at(Instant::now())
    }

    /// Mean of the values with `timestamp >= now - window`, or `0.0` when
    /// none qualify. Does not depend on a recent push for eviction.
    pub fn average_at(&self, now: Instant) -> f64 {
        let cutoff = self.cutoff(now);
        let (sum, count) = self
            .entries
            .iter()
            .filter(|(t, _)| cutoff.is_none_or(|c| *t >= c))
            .fold((0.0, 0usize), |(sum, n), (_, v)| (sum + v, n + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Number of retained entries (including any not yet evicted by a push).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn reset(&mut self) {
        self.entries.clear();
    }
}
