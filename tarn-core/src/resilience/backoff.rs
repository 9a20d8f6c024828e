//! Retry backoff for broker calls and reconnection
//!
//! Two flavours are used in the control plane: exponential backoff with
//! jitter for reconnection loops, and fixed-interval backoff for bounded
//! order-submission retries.

use rand::Rng;
use std::time::Duration;

/// Configuration for retry backoff
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling on the delay between retries
    pub max_delay: Duration,
    /// Growth factor per retry (1.0 = fixed interval)
    pub multiplier: f64,
    /// Maximum number of retry attempts (None = unlimited)
    pub max_retries: Option<usize>,
    /// Randomization applied to each delay, 0.0 to 1.0
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(10),
            jitter_factor: 0.1,
        }
    }
}

impl BackoffConfig {
    /// Fixed-interval retries: used for order submission, where the retry
    /// budget is small and predictability matters more than spreading load.
    pub fn fixed(interval: Duration, max_retries: usize) -> Self {
        Self {
            initial_delay: interval,
            max_delay: interval,
            multiplier: 1.0,
            max_retries: Some(max_retries),
            jitter_factor: 0.0,
        }
    }

    /// Unlimited retries: used by the broker reconnect loop when the
    /// operator has not bounded it.
    pub fn unlimited() -> Self {
        Self {
            max_retries: None,
            ..Default::default()
        }
    }
}

/// Backoff state machine. Not thread-safe; each retry loop owns its own.
pub struct Backoff {
    config: BackoffConfig,
    current_attempt: usize,
    current_delay: Duration,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self {
            current_delay: config.initial_delay,
            current_attempt: 0,
            config,
        }
    }

    /// Next delay to sleep before retrying, advancing the state.
    ///
    /// Returns None once the retry budget is exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.config.max_retries {
            if self.current_attempt >= max {
                return None;
            }
        }

        let delay = self.jittered(self.current_delay);

        self.current_attempt += 1;
        self.current_delay = std::cmp::min(
            Duration::from_secs_f64(self.current_delay.as_secs_f64() * self.config.multiplier),
            self.config.max_delay,
        );

        Some(delay)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.config.jitter_factor == 0.0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen::<f64>() * self.config.jitter_factor;
        let multiplier = 1.0 + (jitter - self.config.jitter_factor / 2.0);
        Duration::from_secs_f64(delay.as_secs_f64() * multiplier)
    }

    /// Reset after a success so the next failure starts from the initial delay.
    pub fn reset(&mut self) {
        self.current_attempt = 0;
        self.current_delay = self.config.initial_delay;
    }

    pub fn attempt_number(&self) -> usize {
        self.current_attempt
    }

    pub fn can_retry(&self) -> bool {
        match self.config.max_retries {
            Some(max) => self.current_attempt < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_growth() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        });

        let d1 = backoff.next_delay().unwrap();
        let d2 = backoff.next_delay().unwrap();
        assert!(d2 > d1);
        assert_eq!(backoff.attempt_number(), 2);
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut backoff = Backoff::new(BackoffConfig::fixed(Duration::from_millis(10), 3));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert!(!backoff.can_retry());
    }

    #[test]
    fn test_fixed_interval_does_not_grow() {
        let mut backoff = Backoff::new(BackoffConfig::fixed(Duration::from_millis(250), 5));
        for _ in 0..5 {
            assert_eq!(backoff.next_delay().unwrap(), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_delay_capped_at_max() {
        let mut backoff = Backoff::new(BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(80),
            multiplier: 2.0,
            max_retries: Some(20),
            jitter_factor: 0.0,
        });

        let mut last = Duration::ZERO;
        for _ in 0..10 {
            if let Some(d) = backoff.next_delay() {
                assert!(d <= Duration::from_millis(80));
                last = d;
            }
        }
        assert_eq!(last, Duration::from_millis(80));
    }

    #[test]
    fn test_reset_restores_initial_delay() {
        let mut backoff = Backoff::new(BackoffConfig {
            jitter_factor: 0.0,
            ..Default::default()
        });
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt_number(), 0);
        assert_eq!(
            backoff.next_delay().unwrap(),
            BackoffConfig::default().initial_delay
        );
    }
}
