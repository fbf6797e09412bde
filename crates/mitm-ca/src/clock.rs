use std::fmt;
use std::sync::Mutex;
use std::time::Duration;

use time::OffsetDateTime;

/// Wall-clock source for validity windows and cache expiry.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(OffsetDateTime::now_utc())
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }

    pub fn set(&self, to: OffsetDateTime) {
        let mut now = self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *now = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `at + by`, or `None` past the representable date range.
pub(crate) fn checked_later(at: OffsetDateTime, by: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(by)
        .ok()
        .and_then(|by| at.checked_add(by))
}

/// `at - by`, or `None` past the representable date range.
pub(crate) fn checked_earlier(at: OffsetDateTime, by: Duration) -> Option<OffsetDateTime> {
    time::Duration::try_from(by)
        .ok()
        .and_then(|by| at.checked_sub(by))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use time::macros::datetime;

    use super::{checked_earlier, checked_later, Clock, ManualClock};

    #[test]
    fn manual_clock_moves_only_on_request() {
        let clock = ManualClock::new(datetime!(2030-01-01 00:00 UTC));
        assert_eq!(clock.now(), datetime!(2030-01-01 00:00 UTC));
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), datetime!(2030-01-01 00:01:30 UTC));
        clock.set(datetime!(2031-06-01 12:00 UTC));
        assert_eq!(clock.now(), datetime!(2031-06-01 12:00 UTC));
    }

    #[test]
    fn checked_offsets_report_overflow_instead_of_panicking() {
        let start = datetime!(2030-01-01 00:00 UTC);
        assert_eq!(
            checked_later(start, Duration::from_secs(60)),
            Some(datetime!(2030-01-01 00:01 UTC))
        );
        assert_eq!(
            checked_earlier(start, Duration::from_secs(60)),
            Some(datetime!(2029-12-31 23:59 UTC))
        );
        assert_eq!(checked_later(start, Duration::from_secs(u64::MAX)), None);
        assert_eq!(checked_earlier(start, Duration::from_secs(u64::MAX)), None);
    }
}
