//! Exponential backoff with jitter, shared by the Deployment Client's inner
//! retry loop. Grounded in the teacher's
//! `utils/error/recovery/retry.rs::RetryPolicy` and
//! `core/router/execution.rs::calculate_retry_delay`.

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: 3,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (1-indexed), capped at `max_delay`,
    /// with ±10% jitter to avoid thundering-herd retries across processes.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_millis() as f64);

        let jitter_factor = 0.1;
        let jitter = capped * jitter_factor * (rand::random::<f64>() - 0.5);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_and_is_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            max_attempts: 5,
        };

        let d1 = policy.delay_for_attempt(1).as_millis();
        let d4 = policy.delay_for_attempt(4).as_millis();
        assert!(d1 <= 110 && d1 >= 90);
        // attempt 4 -> 100 * 2^3 = 800, capped at 500, +-10% jitter
        assert!(d4 <= 550);
    }
}
