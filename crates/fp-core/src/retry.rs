//! Retry with exponential backoff and jitter.
//!
//! After failed attempt `i` (0-indexed) the policy sleeps
//! `base_delay * 2^i` plus a uniform jitter in `[0, base_delay * 2^i / 2)`,
//! unless that was the last attempt. Every error is treated as retryable.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use fp_config::RetryConfig;

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("operation failed after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    /// The error returned by the final attempt.
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::Exhausted { source, .. } => source,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    /// `max_attempts` of zero is treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Backoff before jitter after failed attempt `attempt` (0-indexed).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }

    fn delay_after(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ceiling = (backoff / 2).as_nanos() as u64;
        if jitter_ceiling == 0 {
            return backoff;
        }
        let jitter = rand::rng().random_range(0..jitter_ceiling);
        backoff.saturating_add(Duration::from_nanos(jitter))
    }

    /// Run `operation` until it succeeds or the attempts are used up.
    pub async fn run<F, Fut, T, E>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut attempt = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempts = attempt + 1, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => {
                    attempt += 1;
                    if attempt >= self.max_attempts {
                        warn!(attempts = attempt, error = %error, "Retry attempts exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: error,
                        });
                    }

                    let delay = self.delay_after(attempt - 1);
                    debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Attempt failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, config.base_delay())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_saturates() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert_eq!(policy.backoff(40), Duration::from_secs(1).saturating_mul(u32::MAX));
    }

    #[test]
    fn test_jitter_stays_below_half() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        for _ in 0..200 {
            let delay = policy.delay_after(1);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay < Duration::from_millis(300));
        }
    }

    #[test]
    fn test_zero_attempts_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts(), 1);
    }
}
