//! Retry pacing for failed `accept()` calls.

use std::time::Duration;

const FLOOR: Duration = Duration::from_millis(1);

/// Exponential back-off applied when the listener fails to accept.
///
/// Each consecutive failure doubles the pause, up to `max_delay`; the next
/// successful accept starts over at `initial_delay`. The defaults pause for
/// 10 ms after the first failure and never more than a second.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Pause after the first failure.
    pub initial_delay: Duration,
    /// Longest pause between attempts.
    pub max_delay: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl BackoffConfig {
    /// Clamp both delays to at least a millisecond, swapping them if the
    /// initial delay exceeds the cap.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use amqpframe::server::BackoffConfig;
    ///
    /// let backoff = BackoffConfig {
    ///     initial_delay: Duration::from_millis(40),
    ///     max_delay: Duration::ZERO,
    /// }
    /// .normalized();
    /// assert_eq!(backoff.initial_delay, Duration::from_millis(1));
    /// assert_eq!(backoff.max_delay, Duration::from_millis(40));
    /// ```
    #[must_use]
    pub fn normalized(self) -> Self {
        let a = self.initial_delay.max(FLOOR);
        let b = self.max_delay.max(FLOOR);
        Self {
            initial_delay: a.min(b),
            max_delay: a.max(b),
        }
    }

    /// Pause to use after `current` if the retry fails as well.
    #[must_use]
    pub fn after(&self, current: Duration) -> Duration { current.saturating_mul(2).min(self.max_delay) }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(5, 10)]
    #[case(400, 800)]
    #[case(600, 1000)]
    #[case(1000, 1000)]
    fn delay_doubles_up_to_the_cap(#[case] current_ms: u64, #[case] expected_ms: u64) {
        let backoff = BackoffConfig::default();
        assert_eq!(
            backoff.after(Duration::from_millis(current_ms)),
            Duration::from_millis(expected_ms)
        );
    }
}
