//! Wall-clock source for hint ages.
//!
//! Hint timestamps are wall-clock UTC, so age checks cannot use a monotonic
//! timer directly. Everything that ages a hint or stamps a new one reads the
//! time through [`Clock`].

use std::fmt;

use chrono::{DateTime, Utc};

pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
