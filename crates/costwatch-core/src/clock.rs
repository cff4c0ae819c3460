//! Wall-clock abstraction so day and period boundaries can be driven in tests.

use chrono::{DateTime, Local, NaiveDate};
use parking_lot::Mutex;

/// Source of the current local time
pub trait Clock: Send + Sync {
    /// Current local time
    fn now(&self) -> DateTime<Local>;

    /// Current calendar day (dedup key for notifications)
    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }

    /// Current usage period as `YYYY-MM`
    fn current_period(&self) -> String {
        self.now().format("%Y-%m").to_string()
    }
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Clock pinned to a settable instant
#[derive(Debug)]
pub struct FixedClock {
    now: Mutex<DateTime<Local>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Local>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    /// Move the clock to a new instant
    pub fn set(&self, now: DateTime<Local>) {
        *self.now.lock() = now;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Local> {
        *self.now.lock()
    }
}
