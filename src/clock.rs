//! Clock abstraction for time-dependent rules.
//!
//! Scores decay, blocks expire, correlation windows slide and the circuit
//! breaker measures degraded time, all against an injected [`Clock`] so that
//! tests can drive time explicitly with [`ManualClock`].

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Port for obtaining the current wall-clock time.
pub trait Clock: Send + Sync + Debug {
    /// Get the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// System clock backed by `Utc::now()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock.
///
/// Clones share the same underlying time, so advancing one clone advances
/// every component holding another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock starting at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Create a clock starting at the current system time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Advance the clock by whole seconds.
    pub fn advance_secs(&self, secs: i64) {
        self.advance(Duration::seconds(secs));
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, by: Duration) {
        let mut current = self.current.lock();
        *current += by;
    }

    /// Set the clock to a specific time.
    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Seconds elapsed from `earlier` to `later`, clamped at zero.
pub fn elapsed_secs(earlier: DateTime<Utc>, later: DateTime<Utc>) -> i64 {
    (later - earlier).num_seconds().max(0)
}
