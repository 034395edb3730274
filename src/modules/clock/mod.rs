//! Injectable time source.
//!
//! Backoff windows, cache expiry, and rotation epochs are all computed
//! against a [`Clock`] so their behaviour can be exercised in tests without
//! real time passing.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Source of both monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic instant used for eligibility windows and deadlines.
    fn now(&self) -> Instant;

    /// Wall-clock timestamp used for persisted state and license windows.
    fn utc_now(&self) -> DateTime<Utc>;
}

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests and simulations.
///
/// Starts at the construction instant and only moves when [`advance`] is
/// called.
///
/// [`advance`]: ManualClock::advance
#[derive(Debug)]
pub struct ManualClock {
    base_instant: Instant,
    base_utc: DateTime<Utc>,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base_instant: Instant::now(),
            base_utc: Utc::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `step`.
    pub fn advance(&self, step: Duration) {
        let mut guard = self.offset.lock().expect("clock offset lock poisoned");
        *guard += step;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().expect("clock offset lock poisoned");
        self.base_instant + offset
    }

    fn utc_now(&self) -> DateTime<Utc> {
        let offset = *self.offset.lock().expect("clock offset lock poisoned");
        self.base_utc + chrono::Duration::from_std(offset).unwrap_or(chrono::Duration::zero())
    }
}
