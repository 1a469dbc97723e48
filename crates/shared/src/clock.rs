//! Injectable time source
//!
//! Billing decisions (invoice dates, attempt timestamps, retry due times)
//! read the clock through this trait so tests and replay tooling can pin
//! time precisely.

use std::sync::{Arc, Mutex};

use time::{Date, OffsetDateTime, UtcOffset};

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> OffsetDateTime;

    /// Today's civil date in the given zone offset
    fn today_in(&self, offset: UtcOffset) -> Date {
        self.now_utc().to_offset(offset).date()
    }
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Settable clock for tests and deterministic replays
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<OffsetDateTime>>,
}

impl ManualClock {
    pub fn new(now: OffsetDateTime) -> Self {
        Self {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn set(&self, now: OffsetDateTime) {
        #[allow(clippy::unwrap_used)] // lock is never poisoned: no panics while held
        let mut guard = self.now.lock().unwrap();
        *guard = now;
    }

    pub fn advance(&self, by: time::Duration) {
        #[allow(clippy::unwrap_used)] // lock is never poisoned: no panics while held
        let mut guard = self.now.lock().unwrap();
        *guard += by;
    }
}

impl Clock for ManualClock {
    fn now_utc(&self) -> OffsetDateTime {
        #[allow(clippy::unwrap_used)] // lock is never poisoned: no panics while held
        let guard = self.now.lock().unwrap();
        *guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_manual_clock_advance() {
        let clock = ManualClock::new(datetime!(2012-05-01 12:00 UTC));
        clock.advance(time::Duration::days(1));
        assert_eq!(clock.now_utc(), datetime!(2012-05-02 12:00 UTC));
    }

    #[test]
    fn test_today_in_offset() {
        let clock = ManualClock::new(datetime!(2012-05-01 23:30 UTC));
        let tokyo = UtcOffset::from_hms(9, 0, 0).unwrap();
        assert_eq!(clock.today_in(tokyo), time::macros::date!(2012 - 05 - 02));
        assert_eq!(clock.today_in(UtcOffset::UTC), time::macros::date!(2012 - 05 - 01));
    }
}
