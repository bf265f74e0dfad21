//! Capped exponential backoff with jitter.
//!
//! Used by the sync provider between reconnect attempts and by rooms between
//! snapshot write/load retries.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    pub multiplier: f64,
    /// Fraction of the delay that is randomized, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl BackoffConfig {
    pub fn for_testing() -> Self {
        Self {
            initial: Duration::from_millis(20),
            max: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Delay for `attempt` (0-based) given a uniform sample in `[0, 1)`.
    pub fn delay_for(&self, attempt: u32, sample: f64) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.min(64) as i32);
        let base = (self.initial.as_secs_f64() * exp).min(self.max.as_secs_f64());
        let jitter = self.jitter.clamp(0.0, 1.0);
        let secs = base * (1.0 - jitter) + base * jitter * sample.clamp(0.0, 1.0);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Attempt counter over a [`BackoffConfig`].
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    pub fn next_delay(&mut self) -> Duration {
        let sample: f64 = rand::rng().random();
        let delay = self.config.delay_for(self.attempt, sample);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_grows_then_caps() {
        let config = BackoffConfig { jitter: 0.0, ..BackoffConfig::default() };
        assert_eq!(config.delay_for(0, 0.3), Duration::from_millis(500));
        assert_eq!(config.delay_for(1, 0.3), Duration::from_secs(1));
        assert_eq!(config.delay_for(3, 0.3), Duration::from_secs(4));
        assert_eq!(config.delay_for(20, 0.3), Duration::from_secs(30));
        assert_eq!(config.delay_for(u32::MAX, 0.3), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let config = BackoffConfig::default();
        let low = config.delay_for(2, 0.0);
        let high = config.delay_for(2, 0.999);
        assert_eq!(low, Duration::from_secs(1));
        assert!(high > low && high <= Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_sequence_and_reset() {
        let mut backoff = Backoff::new(BackoffConfig::for_testing());
        let mut last = Duration::ZERO;
        for _ in 0..10 {
            last = backoff.next_delay();
            assert!(last <= Duration::from_millis(200));
        }
        assert!(last >= Duration::from_millis(100));
        assert_eq!(backoff.attempt(), 10);
        backoff.reset();
        assert!(backoff.next_delay() <= Duration::from_millis(20));
    }
}
