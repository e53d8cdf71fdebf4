//! # Load Sampling
//!
//! Invocation counting and the invocations-per-second figure reported with
//! every heartbeat.
//!
//! The counter is written by every in-flight invocation and drained by the
//! heartbeat task, so it is a plain atomic; the sample timestamp is only ever
//! touched by the sampler.

use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::time::Instant;

/// Counts invocations since the last sample.
#[derive(Debug)]
pub struct InvocationCounter {
    count: AtomicU64,
    last_sample: Mutex<Instant>,
}

impl InvocationCounter {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(now: Instant) -> Self {
        Self {
            count: AtomicU64::new(0),
            last_sample: Mutex::new(now),
        }
    }

    /// Records one invocation.
    pub fn record(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Invocations since the last sample, without resetting.
    pub fn pending(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Computes the load for the window ending at `now` and starts a new window.
    ///
    /// Invocations recorded while sampling land in the next window.
    pub fn sample(&self, now: Instant) -> u64 {
        let invocations = self.count.swap(0, Ordering::AcqRel);
        let mut last = match self.last_sample.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let elapsed = now.saturating_duration_since(*last);
        *last = now;
        load_per_second(invocations, elapsed)
    }
}

impl Default for InvocationCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// `round(invocations / seconds)`, with an explicit zero when nothing ran.
///
/// Windows shorter than a millisecond count as one millisecond.
pub fn load_per_second(invocations: u64, elapsed: Duration) -> u64 {
    if invocations == 0 {
        return 0;
    }
    let millis = elapsed.as_millis().max(1) as f64;
    (invocations as f64 / (millis / 1000.0)).round() as u64
}
