//! Backoff schedule for empty polls

use std::time::Duration;

use crate::config::{BackoffStrategy, PollerConfig};

/// Delay state for one running episode
///
/// Starts at `initial_delay`, grows on every empty poll up to `max_delay`,
/// and drops back to `initial_delay` as soon as a payload is seen.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    initial: Duration,
    max: Duration,
    min_increment: Duration,
    strategy: BackoffStrategy,
    current: Duration,
}

impl BackoffSchedule {
    /// Create a schedule positioned at the initial delay
    pub fn new(config: &PollerConfig) -> Self {
        Self {
            initial: config.initial_delay,
            max: config.max_delay,
            min_increment: config.min_increment,
            strategy: config.backoff,
            current: config.initial_delay.min(config.max_delay),
        }
    }

    /// Delay to sleep after the current empty poll
    pub fn current(&self) -> Duration {
        self.current
    }

    /// Grow the delay after an empty poll and return the new value
    pub fn advance(&mut self) -> Duration {
        let grown = match self.strategy {
            BackoffStrategy::Exponential { multiplier } => {
                Duration::try_from_secs_f64(self.current.as_secs_f64() * multiplier.max(1.0))
                    .unwrap_or(self.max)
            }
            BackoffStrategy::Linear { step } => self.current.saturating_add(step),
        };
        let floor = self.current.saturating_add(self.min_increment);
        self.current = grown.max(floor).min(self.max);
        self.current
    }

    /// Return to the initial delay after a payload
    pub fn reset(&mut self) {
        self.current = self.initial.min(self.max);
    }

    /// Whether the delay has reached the configured cap
    pub fn is_saturated(&self) -> bool {
        self.current >= self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn millis(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    #[test]
    fn test_exponential_from_zero() {
        let config = PollerConfig::new(millis(500));
        let mut schedule = BackoffSchedule::new(&config);

        assert_eq!(schedule.current(), Duration::ZERO);

        let delays: Vec<_> = (0..9).map(|_| schedule.advance()).collect();
        assert_eq!(
            delays,
            vec![
                millis(10),
                millis(20),
                millis(40),
                millis(80),
                millis(160),
                millis(320),
                millis(500),
                millis(500),
                millis(500),
            ]
        );
        assert!(schedule.is_saturated());
    }

    #[test]
    fn test_linear_growth() {
        let config = PollerConfig::new(millis(100))
            .with_initial_delay(millis(10))
            .with_linear_step(millis(30));
        let mut schedule = BackoffSchedule::new(&config);

        assert_eq!(schedule.advance(), millis(40));
        assert_eq!(schedule.advance(), millis(70));
        assert_eq!(schedule.advance(), millis(100));
        assert_eq!(schedule.advance(), millis(100));
    }

    #[test]
    fn test_min_increment_applies_to_small_steps() {
        let config = PollerConfig::new(millis(100))
            .with_min_increment(millis(25))
            .with_linear_step(millis(1));
        let mut schedule = BackoffSchedule::new(&config);

        assert_eq!(schedule.advance(), millis(25));
        assert_eq!(schedule.advance(), millis(50));
    }

    #[test]
    fn test_monotonic_and_capped() {
        let config = PollerConfig::new(millis(1_000))
            .with_initial_delay(millis(3))
            .with_backoff_multiplier(1.3);
        let mut schedule = BackoffSchedule::new(&config);

        let mut previous = schedule.current();
        for _ in 0..100 {
            let next = schedule.advance();
            assert!(next >= previous);
            assert!(next <= config.max_delay);
            previous = next;
        }
        assert_eq!(previous, config.max_delay);
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max() {
        let config = PollerConfig::new(Duration::from_secs(5)).with_backoff_multiplier(1e20);
        assert!(config.validate().is_ok());
        let mut schedule = BackoffSchedule::new(&config);

        assert_eq!(schedule.advance(), millis(10));
        assert_eq!(schedule.advance(), Duration::from_secs(5));
        assert_eq!(schedule.advance(), Duration::from_secs(5));
        assert!(schedule.is_saturated());
    }

    #[test]
    fn test_reset_returns_to_initial() {
        let config = PollerConfig::new(millis(500)).with_initial_delay(millis(20));
        let mut schedule = BackoffSchedule::new(&config);

        for _ in 0..10 {
            schedule.advance();
        }
        assert!(schedule.is_saturated());

        schedule.reset();
        assert_eq!(schedule.current(), millis(20));
        assert_eq!(schedule.advance(), millis(40));
    }
}
