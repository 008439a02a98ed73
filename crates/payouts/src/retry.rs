//! Bounded retry with exponential backoff for transient provider errors.

use std::time::Duration;

use affiliate_core::config::PayoutConfig;
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PayoutConfig) -> Self {
        Self {
            max_retries: config.max_transient_retries,
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-indexed).
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms =
            self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped_ms = base_ms.min(self.max_backoff_ms as f64);

        let final_ms = if self.jitter {
            // ±25%, never above the cap.
            let factor = rand::thread_rng().gen_range(0.75..1.25);
            (capped_ms * factor).min(self.max_backoff_ms as f64)
        } else {
            capped_ms
        };

        Duration::from_millis(final_ms as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_and_capped() {
        let policy = RetryPolicy {
            jitter: false,
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(800));
        assert_eq!(policy.backoff_for_attempt(10), Duration::from_millis(5_000));
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.backoff_for_attempt(1).as_millis();
            assert!((300..=500).contains(&d), "{d}");
        }
    }
}
