//! Fixed-rate dispatch scheduling.
//!
//! Operation `i` is intended to start at `origin + i / rate`. When the loop is ahead
//! of schedule the pacer sleeps until the intended instant; when it is behind, the
//! operation goes out immediately and the schedule is re-anchored at that dispatch, so
//! a slow call is followed by normal spacing instead of a burst of overdue calls.

use plcbench_common::{BenchError, Result};
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// When an operation was meant to go out and when it actually did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub intended: Instant,
    pub actual: Instant,
}

#[derive(Debug)]
pub struct RatePacer {
    rate: f64,
    start: Instant,
    origin: Instant,
    origin_index: usize,
    slips: usize,
}

impl RatePacer {
    /// Pacer whose schedule starts now
    pub fn new(rate: f64) -> Result<Self> {
        Self::starting_at(rate, Instant::now())
    }

    pub fn starting_at(rate: f64, start: Instant) -> Result<Self> {
        if !(rate.is_finite() && rate > 0.0) {
            return Err(BenchError::config(format!("target rate must be positive, got {}", rate)));
        }
        Ok(Self {
            rate,
            start,
            origin: start,
            origin_index: 0,
            slips: 0,
        })
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Gap between slots; saturates for rates too small to express
    pub fn interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.rate).unwrap_or(Duration::MAX)
    }

    /// Instant the schedule started
    pub fn start(&self) -> Instant {
        self.start
    }

    /// How often the schedule had to be re-anchored after a late dispatch
    pub fn slips(&self) -> usize {
        self.slips
    }

    /// Intended dispatch instant of operation `index` under the current anchor
    pub fn intended(&self, index: usize) -> Instant {
        let steps = index.saturating_sub(self.origin_index) as f64;
        let nanos = (steps * 1e9 / self.rate).round() as u64;
        self.origin + Duration::from_nanos(nanos)
    }

    /// Wait until operation `index` may be dispatched.
    ///
    /// Returns `BenchError::Cancelled` if `cancel` fires first; nothing is dispatched then.
    pub async fn wait(&mut self, index: usize, cancel: &CancellationToken) -> Result<Dispatch> {
        if cancel.is_cancelled() {
            return Err(BenchError::Cancelled);
        }
        let intended = self.intended(index);
        let now = Instant::now();
        if now < intended {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BenchError::Cancelled),
                _ = sleep_until(intended) => {}
            }
            return Ok(Dispatch {
                intended,
                actual: Instant::now(),
            });
        }
        if now > intended {
            trace!(
                "operation {} is {:?} behind schedule, re-anchoring",
                index,
                now - intended
            );
            self.origin = now;
            self.origin_index = index;
            self.slips += 1;
        }
        Ok(Dispatch { intended, actual: now })
    }
}
