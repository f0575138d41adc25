//! Deterministic time.

use crate::lock;
use boxoffice_core::environment::Clock;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::{Arc, Mutex};

/// A clock that only moves when told to.
///
/// Clones share the same time, so a test can hand one clone to the services
/// and keep another to advance.
///
/// # Example
///
/// ```
/// use boxoffice_testing::ManualClock;
/// use boxoffice_core::environment::Clock;
/// use chrono::Duration;
///
/// let clock = ManualClock::default();
/// let shared = clock.clone();
/// let start = clock.now();
/// shared.advance(Duration::seconds(301));
/// assert!(clock.now() > start + Duration::minutes(5));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// A clock frozen at `time`.
    #[must_use]
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(time)),
        }
    }

    /// Move time forward.
    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    /// Jump to `time`.
    pub fn set(&self, time: DateTime<Utc>) {
        *lock(&self.now) = time;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(test_clock())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// The default test epoch: 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_clock() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
