//! Retry with exponential backoff
//!
//! Used on the worker's reporting path, where a transient queue or
//! coordination-store error must not leave a crawl without its completion
//! record.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    pub max_retries: u32,

    /// Base delay in milliseconds for exponential backoff
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds (caps exponential growth)
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn with_delays(max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            max_delay_ms,
            backoff_multiplier: 2.0,
        }
    }

    /// Delay before `attempt` (the first attempt runs immediately)
    fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay_ms = if attempt == 0 {
            0
        } else {
            let exponential =
                self.base_delay_ms as f64 * self.backoff_multiplier.powi((attempt - 1) as i32);
            (exponential as u64).min(self.max_delay_ms)
        };

        Duration::from_millis(delay_ms)
    }
}

/// Run `operation` until it succeeds, retrying only errors accepted by `should_retry`
///
/// ```no_run
/// use crawlq::utils::retry::{with_retry_if, RetryConfig};
/// use crawlq::queue::QueueError;
///
/// async fn ping() -> Result<(), QueueError> {
///     Ok(())
/// }
///
/// # async fn run() -> Result<(), QueueError> {
/// with_retry_if(&RetryConfig::default(), ping, QueueError::is_recoverable).await?;
/// # Ok(())
/// # }
/// ```
pub async fn with_retry_if<T, E, F, Fut, P>(
    config: &RetryConfig,
    mut operation: F,
    should_retry: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            let delay = config.calculate_delay(attempt);
            debug!(
                attempt = attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying operation after delay"
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if !should_retry(&e) => {
                warn!(error = %e, "Non-retryable error encountered");
                return Err(e);
            }
            Err(e) if attempt >= config.max_retries => {
                warn!(
                    attempts = attempt + 1,
                    error = %e,
                    "Operation failed, retries exhausted"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    attempt = attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "Operation failed, will retry"
                );
            }
        }

        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    fn fast(max_retries: u32) -> RetryConfig {
        RetryConfig::with_delays(max_retries, 1, 5)
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let result = with_retry_if(&fast(3), || async { Ok::<_, TestError>(42) }, |_| true).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_success_after_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = with_retry_if(
            &fast(3),
            move || {
                let attempts = Arc::clone(&counter);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(TestError::Transient);
                    }
                    Ok(42)
                }
            },
            |e| *e == TestError::Transient,
        )
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), TestError> = with_retry_if(
            &fast(2),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Transient) }
            },
            |_| true,
        )
        .await;

        assert_eq!(result.unwrap_err(), TestError::Transient);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_if_stops_on_fatal() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), TestError> = with_retry_if(
            &fast(5),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(TestError::Fatal) }
            },
            |e| *e == TestError::Transient,
        )
        .await;

        assert_eq!(result.unwrap_err(), TestError::Fatal);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_calculate_delay() {
        let config = RetryConfig::with_delays(5, 1000, 30_000);

        assert_eq!(config.calculate_delay(0), Duration::from_millis(0));
        assert_eq!(config.calculate_delay(1), Duration::from_millis(1000));
        assert_eq!(config.calculate_delay(2), Duration::from_millis(2000));
        assert_eq!(config.calculate_delay(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::with_delays(10, 1000, 5000);
        assert_eq!(config.calculate_delay(10), Duration::from_millis(5000));
    }
}
