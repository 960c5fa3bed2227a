//! Time source seam.
//!
//! Everything time-dependent (event timestamps, window retention, replay
//! pacing, session aging) reads through [`BusClock`] so tests can sequence
//! same-second behaviour deterministically instead of sleeping.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Duration, Utc};

/// Source of "now" for the bus.
pub trait BusClock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;
}

impl fmt::Debug for dyn BusClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BusClock")
    }
}

/// Process wall clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl BusClock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-cranked clock for tests and deterministic simulations.
///
/// Stores microseconds since epoch; `advance` never goes backwards.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            micros: AtomicI64::new(start.timestamp_micros()),
        }
    }

    /// Starts at the Unix epoch.
    pub fn at_epoch() -> Self {
        Self {
            micros: AtomicI64::new(0),
        }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        self.micros.store(to.timestamp_micros(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let us = by.num_microseconds().unwrap_or(i64::MAX);
        self.micros.fetch_add(us.max(0), Ordering::SeqCst);
    }

    /// Convenience for fractional-second steps in tests.
    pub fn advance_secs(&self, secs: f64) {
        self.advance(Duration::microseconds((secs * 1_000_000.0) as i64));
    }
}

impl BusClock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(self.micros.load(Ordering::SeqCst))
            .unwrap_or_else(|| DateTime::from_timestamp(0, 0).expect("epoch is representable"))
    }
}

/// Converts a fractional-seconds span into a chrono duration.
pub(crate) fn secs_f64(secs: f64) -> Duration {
    Duration::microseconds((secs * 1_000_000.0) as i64)
}
