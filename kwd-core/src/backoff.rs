//! Delay policies for the ingestion loop.
//!
//! - [`PollBackoff`]: linear growth while the stream keeps returning nothing,
//!   capped, reset by any delivery.
//! - [`JitterBackoff`]: uniformly random delay inside a window, used to pause
//!   a whole replica after upstream errors so replicas do not retry in step.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct PollBackoff {
    step: Duration,
    max: Duration,
    empty_polls: u32,
}

impl PollBackoff {
    #[must_use]
    pub fn new(step: Duration, max: Duration) -> Self {
        Self {
            step,
            max,
            empty_polls: 0,
        }
    }

    /// Records an empty poll and returns how long to wait before the next one.
    pub fn on_empty(&mut self) -> Duration {
        self.empty_polls = self.empty_polls.saturating_add(1);
        self.step.saturating_mul(self.empty_polls).min(self.max)
    }

    pub fn reset(&mut self) {
        self.empty_polls = 0;
    }

    #[must_use]
    pub fn empty_polls(&self) -> u32 {
        self.empty_polls
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterBackoff {
    min: Duration,
    max: Duration,
}

impl JitterBackoff {
    /// Bounds are swapped if given out of order.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        if min <= max {
            Self { min, max }
        } else {
            Self { min: max, max: min }
        }
    }

    #[must_use]
    pub fn next_delay(&self) -> Duration {
        if self.min == self.max {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..=self.max)
    }

    #[must_use]
    pub fn bounds(&self) -> (Duration, Duration) {
        (self.min, self.max)
    }
}
