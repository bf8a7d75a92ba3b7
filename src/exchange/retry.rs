//! Retry with exponential backoff for transient gateway errors.
//!
//! Rate limits, timeouts and connection failures are retried; anything the
//! exchange answered with a structured error code is returned immediately.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::ExchangeError;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Random spread applied to each delay, as a fraction (0.25 = ±25%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl RetryConfig {
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// base × 2^attempt, capped, with jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt.min(16));
        let delay = self.base_delay.saturating_mul(exp).min(self.max_delay);

        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the retry budget is spent
pub async fn with_retry<T, F, Fut>(config: &RetryConfig, operation: F) -> Result<T, ExchangeError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempts = attempt + 1, "request succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) if attempt >= config.max_retries => {
                warn!(error = %e, attempts = attempt + 1, "retry budget exhausted");
                return Err(e);
            }
            Err(e) => {
                let delay = config.delay_for(attempt);
                warn!(
                    error = %e,
                    attempt = attempt + 1,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    "transient error, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast() -> RetryConfig {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(cfg.delay_for(0), Duration::from_secs(5));
        assert_eq!(cfg.delay_for(1), Duration::from_secs(10));
        assert_eq!(cfg.delay_for(2), Duration::from_secs(20));
        assert_eq!(cfg.delay_for(3), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let cfg = RetryConfig {
            jitter: 0.25,
            ..RetryConfig::default()
        };
        for _ in 0..50 {
            let d = cfg.delay_for(0);
            assert!(d >= Duration::from_millis(3750) && d <= Duration::from_millis(6250));
        }
    }

    #[tokio::test]
    async fn test_retries_rate_limit_then_succeeds() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = with_retry(&fast(), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ExchangeError::RateLimited)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_api_error_not_retried() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = with_retry(&fast(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Api {
                    code: "51008".to_string(),
                    msg: "Insufficient balance".to_string(),
                })
            }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::Api { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_budget_exhausted() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result: Result<(), _> = with_retry(&fast(), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(ExchangeError::Timeout)
            }
        })
        .await;

        assert!(matches!(result, Err(ExchangeError::Timeout)));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
