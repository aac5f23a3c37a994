use chrono::{DateTime, Duration, Utc};
use std::sync::{Mutex, PoisonError};

/// Upper bound for any duration given in seconds: one hundred years
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// `secs` as a duration, or `None` past `MAX_DURATION_SECS`
pub fn seconds(secs: u64) -> Option<Duration> {
    if secs > MAX_DURATION_SECS {
        return None;
    }
    Duration::try_seconds(i64::try_from(secs).ok()?)
}

/// `secs` as a duration, saturating at `MAX_DURATION_SECS`
pub fn saturating_seconds(secs: u64) -> Duration {
    seconds(secs.min(MAX_DURATION_SECS)).unwrap_or_else(Duration::zero)
}

/// `at` plus `secs`, or `None` when either is out of range
pub fn after(at: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    at.checked_add_signed(seconds(secs)?)
}

/// Source of wall-clock time for the engine and its workers
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
