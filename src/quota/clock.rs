//! Calendar source for daily quota windows

use chrono::{Local, NaiveDate};
use parking_lot::Mutex;

/// Provides the current calendar day
pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Server-local calendar day
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    today: Mutex<NaiveDate>,
}

impl ManualClock {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            today: Mutex::new(today),
        }
    }

    pub fn set(&self, today: NaiveDate) {
        *self.today.lock() = today;
    }

    pub fn advance_days(&self, days: i64) {
        let mut today = self.today.lock();
        *today += chrono::Duration::days(days);
    }
}

impl Clock for ManualClock {
    fn today(&self) -> NaiveDate {
        *self.today.lock()
    }
}
