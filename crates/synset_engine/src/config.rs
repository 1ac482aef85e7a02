//! Configuration for a replicated set.

use rand::Rng;
use std::time::Duration;

/// Configuration for one replicated set.
#[derive(Debug, Clone)]
pub struct SetConfig {
    /// Shared store key holding the membership.
    pub key: String,
    /// Broadcast channel carrying operations.
    pub channel: String,
    /// Retry behavior for the seed fetch.
    pub seed_retry: RetryConfig,
    /// Queue length at which a warning is logged.
    pub queue_warn_threshold: usize,
}

impl SetConfig {
    /// Creates a configuration whose channel is the store key.
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            channel: key.clone(),
            key,
            seed_retry: RetryConfig::default(),
            queue_warn_threshold: 10_000,
        }
    }

    /// Sets the broadcast channel.
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    /// Sets the seed retry configuration.
    pub fn with_seed_retry(mut self, retry: RetryConfig) -> Self {
        self.seed_retry = retry;
        self
    }

    /// Sets the queue warning threshold.
    pub fn with_queue_warn_threshold(mut self, threshold: usize) -> Self {
        self.queue_warn_threshold = threshold;
        self
    }
}

/// Backoff for the seed fetch that follows each confirmed subscription.
///
/// Only retryable store errors are retried. A fetch that is superseded by a
/// newer subscription stops retrying on its own.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Fetch attempts per seed load, the first one included.
    pub max_attempts: u32,
    /// Wait before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on the wait between fetches.
    pub max_delay: Duration,
    /// Growth factor applied to the wait after each failed retry.
    pub backoff_multiplier: f64,
    /// Adds up to a quarter of the wait at random, so replicas that lost
    /// their subscription together do not refetch in lockstep.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Allows `max_attempts` fetches per seed load, starting at 100ms
    /// apart and doubling up to 30s.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// A single fetch per seed load. Failures wait for the next
    /// resubscription.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the wait before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Caps the wait between fetches.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, add_jitter: bool) -> Self {
        self.add_jitter = add_jitter;
        self
    }

    /// Returns how long to wait before the next fetch, given how many
    /// fetches of this seed load have already failed.
    pub fn delay_for_attempt(&self, failed: u32) -> Duration {
        let Some(retries) = failed.checked_sub(1) else {
            return Duration::ZERO;
        };

        let growth = self.backoff_multiplier.powi(retries.min(i32::MAX as u32) as i32);
        let secs = self.initial_delay.as_secs_f64() * growth;
        let wait = if secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        };

        if self.add_jitter {
            wait + wait.mul_f64(0.25 * rand::thread_rng().gen::<f64>())
        } else {
            wait
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_defaults_to_key() {
        let config = SetConfig::new("online-users");
        assert_eq!(config.key, "online-users");
        assert_eq!(config.channel, "online-users");

        let config = SetConfig::new("online-users").with_channel("presence");
        assert_eq!(config.key, "online-users");
        assert_eq!(config.channel, "presence");
    }

    #[test]
    fn set_config_builder() {
        let config = SetConfig::new("k")
            .with_seed_retry(RetryConfig::no_retry())
            .with_queue_warn_threshold(5);
        assert_eq!(config.seed_retry.max_attempts, 1);
        assert_eq!(config.queue_warn_threshold, 5);
    }

    #[test]
    fn first_fetch_is_immediate() {
        assert_eq!(RetryConfig::default().delay_for_attempt(0), Duration::ZERO);
        assert_eq!(RetryConfig::no_retry().delay_for_attempt(3), Duration::ZERO);
    }

    #[test]
    fn refetch_waits_grow_until_capped() {
        let retry = RetryConfig::new(6)
            .with_initial_delay(Duration::from_millis(50))
            .with_max_delay(Duration::from_millis(300))
            .with_backoff_multiplier(3.0)
            .with_jitter(false);

        let waits: Vec<_> = (1..=4).map(|failed| retry.delay_for_attempt(failed)).collect();
        assert_eq!(
            waits,
            vec![
                Duration::from_millis(50),
                Duration::from_millis(150),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(200));
        for _ in 0..32 {
            let wait = retry.delay_for_attempt(1);
            assert!(wait >= Duration::from_millis(200));
            assert!(wait <= Duration::from_millis(250));
        }
    }
}
