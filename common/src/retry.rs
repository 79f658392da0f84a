// Retry-delay policies for failed job executions
//
// The scheduler asks the policy how long to wait before re-firing a failed
// occurrence. The retry budget itself lives on the job (`JobDetails::retries`).

use crate::config::{RetryConfig, RetryStrategyKind};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// RetryPolicy computes the delay before retry number `attempt` (1-based)
pub trait RetryPolicy: Send + Sync {
    fn retry_delay(&self, attempt: u32) -> Duration;
}

/// Same delay for every attempt
#[derive(Debug, Clone)]
pub struct FixedBackoff {
    delay: Duration,
}

impl FixedBackoff {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RetryPolicy for FixedBackoff {
    fn retry_delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// Exponential backoff with jitter
/// Sequence: base, 3x base, 9x base, ... capped at `max_delay`
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, jitter_factor: f64) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    /// Delay without jitter
    fn calculate_base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let factor = 3_u32.saturating_pow(exponent);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor == 0.0 {
            return delay;
        }

        let jitter_range_ms = (delay.as_millis() as f64 * self.jitter_factor) as u64;
        if jitter_range_ms == 0 {
            return delay;
        }

        let jitter_ms = rand::thread_rng().gen_range(0..=jitter_range_ms);
        delay + Duration::from_millis(jitter_ms)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn retry_delay(&self, attempt: u32) -> Duration {
        self.add_jitter(self.calculate_base_delay(attempt))
    }
}

/// Build the configured retry policy
pub fn build_policy(config: &RetryConfig) -> Arc<dyn RetryPolicy> {
    match config.strategy {
        RetryStrategyKind::Fixed => {
            Arc::new(FixedBackoff::new(Duration::from_millis(config.base_delay_ms)))
        }
        RetryStrategyKind::Exponential => Arc::new(ExponentialBackoff::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_factor,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_sequence() {
        let strategy =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1800), 0.0);

        assert_eq!(strategy.retry_delay(1), Duration::from_secs(5));
        assert_eq!(strategy.retry_delay(2), Duration::from_secs(15));
        assert_eq!(strategy.retry_delay(3), Duration::from_secs(45));
        assert_eq!(strategy.retry_delay(4), Duration::from_secs(135));
        assert_eq!(strategy.retry_delay(6), Duration::from_secs(1215));

        // 5 * 3^6 = 3645 seconds, capped at 1800
        assert_eq!(strategy.retry_delay(7), Duration::from_secs(1800));
        assert_eq!(strategy.retry_delay(u32::MAX), Duration::from_secs(1800));
    }

    #[test]
    fn test_attempt_zero_is_treated_as_first() {
        let strategy = ExponentialBackoff::new(Duration::from_secs(2), Duration::from_secs(60), 0.0);
        assert_eq!(strategy.retry_delay(0), strategy.retry_delay(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let strategy =
            ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(1800), 0.1);

        for _ in 0..20 {
            let delay = strategy.retry_delay(1).as_millis();
            assert!(
                (5000..=5500).contains(&delay),
                "Delay {}ms should be between 5000ms and 5500ms",
                delay
            );
        }
    }

    #[test]
    fn test_jitter_factor_clamping() {
        let low = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(10), -0.5);
        assert_eq!(low.jitter_factor, 0.0);

        let high = ExponentialBackoff::new(Duration::from_secs(5), Duration::from_secs(10), 1.5);
        assert_eq!(high.jitter_factor, 1.0);
    }

    #[test]
    fn test_fixed_backoff() {
        let strategy = FixedBackoff::new(Duration::from_millis(250));
        for attempt in 1..10 {
            assert_eq!(strategy.retry_delay(attempt), Duration::from_millis(250));
        }
    }

    #[test]
    fn test_build_policy_from_config() {
        let config = RetryConfig {
            strategy: RetryStrategyKind::Fixed,
            base_delay_ms: 750,
            max_delay_ms: 60_000,
            jitter_factor: 0.0,
        };
        let policy = build_policy(&config);
        assert_eq!(policy.retry_delay(3), Duration::from_millis(750));

        let config = RetryConfig {
            strategy: RetryStrategyKind::Exponential,
            ..config
        };
        let policy = build_policy(&config);
        assert_eq!(policy.retry_delay(2), Duration::from_millis(2250));
    }
}
