//! Wall clock driven by the tokio timer.

use chrono::{DateTime, Utc};
use kwd_core::Clock;
use tokio::time::Instant;

/// Reads wall-clock time as `origin + elapsed tokio time`.
///
/// Under a paused runtime the clock only moves when tokio time does, so lease
/// spacing, backoff sleeps and hint ages all advance together.
#[derive(Debug, Clone, Copy)]
pub struct TimerClock {
    wall_origin: DateTime<Utc>,
    origin: Instant,
}

impl TimerClock {
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    pub fn starting_at(wall_origin: DateTime<Utc>) -> Self {
        Self {
            wall_origin,
            origin: Instant::now(),
        }
    }
}

impl Default for TimerClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TimerClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_advances_with_tokio_time() {
        let origin = Utc::now();
        let clock = TimerClock::starting_at(origin);
        assert_eq!(clock.now(), origin);

        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(clock.now(), origin + chrono::Duration::seconds(41));
    }
}
