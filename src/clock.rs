//! Time sources.
//!
//! All window, profile and coordinator arithmetic works in fractional Unix
//! seconds taken from a [`Clock`], so tests can drive time explicitly.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current time in fractional seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;

    /// The current time as a UTC timestamp, at microsecond precision.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_micros((self.now() * 1_000_000.0) as i64).unwrap_or_default()
    }
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock stopped at `start`.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }

    /// Move forward by `secs`.
    pub fn advance(&self, secs: f64) {
        *self.now.lock() += secs;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
