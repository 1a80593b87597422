//! Clocks supplying record timestamps and watermarks.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

use crate::value::Value;

/// A source of timestamps for windowing.
///
/// `watermark` is a lower bound on the timestamps of all records this
/// clock will produce in the future; windows close against it.
pub trait Clock: Send {
    /// The timestamp for a record. May inspect the record.
    fn now_for(&mut self, record: &Value) -> DateTime<Utc>;

    /// A lower bound on all future timestamps.
    fn watermark(&mut self) -> DateTime<Utc>;
}

/// Wall-clock time for both timestamps and watermark.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_for(&mut self, _record: &Value) -> DateTime<Utc> {
        Utc::now()
    }

    fn watermark(&mut self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock advanced by hand.
///
/// Cloned handles share the value, so a test (or a test source's
/// generator) can advance time while the dataflow observes it. Essential
/// for deterministic window tests.
#[derive(Clone)]
pub struct TestingClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl TestingClock {
    /// A clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> TestingClock {
        TestingClock { now: Arc::new(Mutex::new(start)) }
    }

    /// The current mock time.
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("poisoned")
    }

    /// Moves the clock to an absolute time.
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().expect("poisoned") = to;
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().expect("poisoned");
        *now = *now + by;
    }
}

impl Clock for TestingClock {
    fn now_for(&mut self, _record: &Value) -> DateTime<Utc> {
        self.now()
    }

    fn watermark(&mut self) -> DateTime<Utc> {
        self.now()
    }
}

/// How a windowed step obtains its clock; built once per worker.
#[derive(Clone)]
pub enum ClockConfig {
    /// Wall time.
    System,
    /// A shared mock clock.
    Testing(TestingClock),
}

impl ClockConfig {
    /// Builds the runtime clock.
    pub fn build(&self) -> Box<dyn Clock> {
        match self {
            ClockConfig::System => Box::new(SystemClock),
            ClockConfig::Testing(clock) => Box::new(clock.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn testing_clock_shares_advances_across_clones() {
        let start = Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap();
        let clock = TestingClock::new(start);
        let mut handle = ClockConfig::Testing(clock.clone()).build();

        assert_eq!(handle.watermark(), start);
        clock.advance(chrono::Duration::seconds(4));
        assert_eq!(handle.watermark(), start + chrono::Duration::seconds(4));
        assert_eq!(handle.now_for(&Value::Null), clock.now());
    }
}
