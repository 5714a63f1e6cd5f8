//! Connect Backoff Policy
//!
//! Exponential backoff with optional jitter for connection attempts. Every
//! policy carries a hard attempt bound; there is no unlimited mode.

use std::time::Duration;

use rand::Rng;

/// Configuration for connect retry behavior.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Maximum delay between attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Total connect attempts before the failure is surfaced.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter_factor: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            multiplier,
            jitter_factor,
            max_attempts,
        }
    }

    /// Create configuration from `ConnectionSettings`.
    #[must_use]
    pub const fn from_connection_settings(settings: &crate::ConnectionSettings) -> Self {
        Self {
            initial_delay: settings.connect_delay_initial,
            max_delay: settings.connect_delay_max,
            multiplier: settings.connect_delay_multiplier,
            jitter_factor: 0.0,
            max_attempts: settings.max_connect_attempts,
        }
    }
}

/// Backoff policy tracking consecutive failures of one descriptor.
///
/// # Example
///
/// ```rust
/// use gq_feed::application::services::backoff::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let mut policy = BackoffPolicy::new(BackoffConfig::default());
///
/// assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
/// assert_eq!(policy.record_failure(), Some(Duration::from_millis(200)));
///
/// // Successful connection
/// policy.reset();
/// assert_eq!(policy.failures(), 0);
/// ```
#[derive(Debug)]
pub struct BackoffPolicy {
    config: BackoffConfig,
    current_delay: Duration,
    failures: u32,
}

impl BackoffPolicy {
    /// Create a new backoff policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        let initial_delay = config.initial_delay;
        Self {
            config,
            current_delay: initial_delay,
            failures: 0,
        }
    }

    /// Record a failed attempt and get the delay before the next one.
    ///
    /// Returns `None` once the failure count reaches `max_attempts`: the
    /// caller must give up.
    #[must_use]
    pub fn record_failure(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if self.failures >= self.config.max_attempts {
            return None;
        }

        let delay_with_jitter = self.apply_jitter(self.current_delay);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.current_delay.as_millis() as f64 * self.config.multiplier).round();
        let next_millis = if scaled.is_finite() && scaled > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            {
                scaled as u128
            }
        } else {
            0
        };
        let capped = next_millis.min(self.config.max_delay.as_millis());
        self.current_delay = Duration::from_millis(u64::try_from(capped).unwrap_or(u64::MAX));

        Some(delay_with_jitter)
    }

    /// Reset the policy after a successful connection.
    pub const fn reset(&mut self) {
        self.current_delay = self.config.initial_delay;
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    #[must_use]
    pub const fn failures(&self) -> u32 {
        self.failures
    }

    /// Configured attempt bound.
    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Delay used before re-opening an invalidated handle.
    #[must_use]
    pub fn reconnect_delay(&self) -> Duration {
        self.apply_jitter(self.config.initial_delay)
    }

    /// Apply jitter to a duration.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * self.config.jitter_factor;
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        let adjusted_millis = (base_millis + jitter).max(1.0);

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let config = BackoffConfig::default();
        assert_eq!(config.initial_delay, Duration::from_millis(100));
        assert_eq!(config.max_delay, Duration::from_secs(30));
        assert!((config.multiplier - 2.0).abs() < f64::EPSILON);
        assert!(config.jitter_factor.abs() < f64::EPSILON);
        assert_eq!(config.max_attempts, 5);
    }

    #[test]
    fn policy_exponential_backoff() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            max_attempts: 10,
            ..BackoffConfig::default()
        });

        assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(200)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(400)));
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(800)));
    }

    #[test]
    fn policy_max_delay_cap() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            initial_delay: Duration::from_secs(16),
            max_attempts: 10,
            ..BackoffConfig::default()
        });

        assert_eq!(policy.record_failure(), Some(Duration::from_secs(16)));
        assert_eq!(policy.record_failure(), Some(Duration::from_secs(30)));
        assert_eq!(policy.record_failure(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn policy_gives_up_at_attempt_bound() {
        let mut policy = BackoffPolicy::new(BackoffConfig::default());

        for expected in 1..=4 {
            assert!(policy.record_failure().is_some());
            assert_eq!(policy.failures(), expected);
        }

        // Fifth failure exhausts five attempts
        assert_eq!(policy.record_failure(), None);
        assert_eq!(policy.failures(), 5);
    }

    #[test]
    fn single_attempt_never_retries() {
        let mut policy = BackoffPolicy::new(BackoffConfig {
            max_attempts: 1,
            ..BackoffConfig::default()
        });
        assert_eq!(policy.record_failure(), None);
    }

    #[test]
    fn policy_reset() {
        let mut policy = BackoffPolicy::new(BackoffConfig::default());

        let _ = policy.record_failure();
        let _ = policy.record_failure();
        assert_eq!(policy.failures(), 2);

        policy.reset();

        assert_eq!(policy.failures(), 0);
        assert_eq!(policy.record_failure(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn policy_jitter_bounds() {
        for _ in 0..100 {
            let mut policy = BackoffPolicy::new(BackoffConfig {
                initial_delay: Duration::from_millis(1000),
                jitter_factor: 0.1,
                ..BackoffConfig::default()
            });

            let millis = policy.record_failure().unwrap().as_millis();

            assert!(millis >= 900, "delay {millis}ms is below minimum 900ms");
            assert!(millis <= 1100, "delay {millis}ms is above maximum 1100ms");
        }
    }
}
