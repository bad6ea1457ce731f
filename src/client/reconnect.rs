//! Fixed-delay schedule for reconnection attempts

use std::time::Duration;

/// Delay between an unexpected disconnect and the first attempt.
pub const FIRST_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Delay between a failed attempt and the next one.
pub const RETRY_DELAY: Duration = Duration::from_secs(10);

/// Retry delays: one initial delay, then a constant delay forever.
/// No growth, no jitter, no attempt limit.
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    first: Duration,
    then: Duration,
    attempts: u32,
}

impl RetrySchedule {
    pub fn new(first: Duration, then: Duration) -> Self {
        Self {
            first,
            then,
            attempts: 0,
        }
    }

    /// Get the delay before the next attempt and count that attempt
    pub fn next_delay(&mut self) -> Duration {
        let delay = if self.attempts == 0 {
            self.first
        } else {
            self.then
        };
        self.attempts = self.attempts.saturating_add(1);
        delay
    }

    /// Attempts scheduled so far
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::new(FIRST_RETRY_DELAY, RETRY_DELAY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_first_then_constant() {
        let mut schedule = RetrySchedule::default();

        assert_eq!(schedule.next_delay(), Duration::from_secs(5));
        assert_eq!(schedule.next_delay(), Duration::from_secs(10));
        assert_eq!(schedule.next_delay(), Duration::from_secs(10));
        assert_eq!(schedule.attempts(), 3);
    }

    #[test]
    fn test_schedule_never_grows() {
        let mut schedule = RetrySchedule::new(Duration::from_secs(1), Duration::from_secs(2));
        schedule.next_delay();

        for _ in 0..1000 {
            assert_eq!(schedule.next_delay(), Duration::from_secs(2));
        }
    }
}
