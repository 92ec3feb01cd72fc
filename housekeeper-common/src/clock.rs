use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// Wall-clock timestamps that advance with the tokio clock.
///
/// The wall time is sampled once and every later reading is offset by the monotonic time elapsed
/// since then, so a paused tokio runtime moves job timestamps forward in lockstep with its timers.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        let elapsed = chrono::Duration::from_std(self.origin.elapsed())
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + elapsed
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_clock_follows_paused_time() {
        let clock = Clock::new();
        let before = clock.now();

        tokio::time::sleep(Duration::from_secs(90)).await;

        assert_eq!(clock.now() - before, chrono::Duration::seconds(90));
    }
}
