use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;

/// Source of wall-clock time for the session engine.
///
/// Elapsed session time is always derived from two clock readings, never from
/// accumulated ticks, so a restart between readings loses nothing.
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

/// Clock that only moves when told to. Backs the timing assertions in tests.
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

    pub fn set(&self, instant: DateTime<Utc>) {
        *self.now.lock().expect("clock mutex poisoned") = instant;
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut guard = self.now.lock().expect("clock mutex poisoned");
        *guard += delta;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::{Clock, ManualClock};
    use chrono::{TimeDelta, TimeZone, Utc};

    #[test]
    fn manual_clock_advances_only_on_request() {
        let start = Utc.timestamp_millis_opt(1_000).single().expect("timestamp");
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(TimeDelta::milliseconds(4_000));
        assert_eq!((clock.now() - start).num_milliseconds(), 4_000);
    }
}
