//! Reconnection Backoff
//!
//! Exponential backoff for outbound stream reconnection. With the defaults
//! (2s base, doubling, 60s cap, no jitter) consecutive failures wait
//! 2, 4, 8, 16, 32, 60, 60, ... seconds. A successful open resets the
//! sequence.

use std::time::Duration;

use rand::Rng;

/// Backoff parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound for any delay.
    pub max_delay: Duration,
    /// Growth factor applied after each failure.
    pub multiplier: f64,
    /// Randomization as a fraction of the delay (0.1 = ±10%). 0 disables.
    pub jitter_factor: f64,
    /// Give up after this many consecutive failures (0 = never).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 0,
        }
    }
}

/// Backoff state for one logical subscription.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current: Duration,
    attempts: u32,
}

impl BackoffPolicy {
    /// Create a policy positioned at the base delay.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let current = config.initial_delay;
        Self {
            config,
            current,
            attempts: 0,
        }
    }

    /// Delay to wait before the next attempt, advancing the sequence.
    ///
    /// Returns `None` once `max_attempts` consecutive failures were reached.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }
        self.attempts += 1;

        let delay = self.current;
        self.current = self.grow(delay);
        Some(self.jitter(delay))
    }

    /// Delay the next failure will wait, without jitter.
    #[must_use]
    pub const fn current_backoff(&self) -> Duration {
        self.current
    }

    /// Return to the base delay after a successful connection.
    pub const fn reset(&mut self) {
        self.current = self.config.initial_delay;
        self.attempts = 0;
    }

    /// Consecutive failures since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempts
    }

    /// Whether another attempt is allowed.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempts < self.config.max_attempts
    }

    fn grow(&self, delay: Duration) -> Duration {
        let scaled = delay.as_secs_f64() * self.config.multiplier;
        Duration::try_from_secs_f64(scaled)
            .unwrap_or(self.config.max_delay)
            .min(self.config.max_delay)
    }

    fn jitter(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return delay;
        }
        let spread = delay.as_secs_f64() * self.config.jitter_factor;
        let offset: f64 = rand::rng().random_range(-spread..=spread);
        Duration::try_from_secs_f64((delay.as_secs_f64() + offset).max(0.001)).unwrap_or(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter() -> BackoffConfig {
        BackoffConfig::default()
    }

    #[test]
    fn default_sequence_doubles_to_cap() {
        let mut policy = BackoffPolicy::new(no_jitter());
        let delays: Vec<u64> = (0..10)
            .map(|_| policy.next_delay().unwrap().as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 60, 60, 60, 60, 60]);
        assert_eq!(policy.attempt_count(), 10);
    }

    #[test]
    fn current_backoff_tracks_next_wait() {
        let mut policy = BackoffPolicy::new(no_jitter());
        assert_eq!(policy.current_backoff(), Duration::from_secs(2));
        let _ = policy.next_delay();
        assert_eq!(policy.current_backoff(), Duration::from_secs(4));
    }

    #[test]
    fn reset_returns_to_base() {
        let mut policy = BackoffPolicy::new(no_jitter());
        for _ in 0..4 {
            let _ = policy.next_delay();
        }
        policy.reset();
        assert_eq!(policy.attempt_count(), 0);
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn max_attempts_stops_retrying() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            max_attempts: 2,
            ..no_jitter()
        });
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_some());
        assert!(policy.next_delay().is_none());
        assert!(!policy.should_retry());
    }

    #[test]
    fn jitter_stays_in_bounds() {
        for _ in 0..100 {
            let mut policy = BackoffPolicy::new(BackoffConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..no_jitter()
            });
            let millis = policy.next_delay().unwrap().as_millis();
            assert!((899..=1100).contains(&millis), "delay {millis}ms out of range");
        }
    }

    #[test]
    fn huge_multiplier_saturates_at_cap() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            multiplier: f64::MAX,
            ..no_jitter()
        });
        let _ = policy.next_delay();
        assert_eq!(policy.next_delay(), Some(Duration::from_secs(60)));
    }
}
