//! Time sources.
//!
//! Run-relative scheduling (generator cut-off, crash times, partition windows)
//! goes through the [`Clock`] trait so tests can drive it by hand. Wall-clock
//! timestamps for readings and latency come from [`unix_timestamp`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quanta::Instant;

/// Monotonic time source measured from an arbitrary origin.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;

    /// Waits `total` on this clock, returning `false` if `shutdown` cut it short.
    fn sleep(&self, total: Duration, shutdown: &AtomicBool) -> bool {
        sleep_unless(total, shutdown)
    }
}

/// Real monotonic clock backed by `quanta`.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        Instant::now().duration_since(self.origin)
    }
}

/// Hand-advanced clock for deterministic tests. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.nanos
            .fetch_add(by.as_nanos() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, to: Duration) {
        self.nanos.store(to.as_nanos() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }

    /// Advances time instantly instead of blocking.
    fn sleep(&self, total: Duration, shutdown: &AtomicBool) -> bool {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        self.advance(total);
        true
    }
}

/// Seconds since the Unix epoch with microsecond resolution.
pub fn unix_timestamp() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Converts fractional seconds to a [`Duration`], saturating instead of panicking.
///
/// NaN and negative values map to zero.
pub fn saturating_secs(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// Sleeps for `total`, waking early if `shutdown` is raised.
///
/// Returns `false` if the sleep was cut short.
pub fn sleep_unless(total: Duration, shutdown: &AtomicBool) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
