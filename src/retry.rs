// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry with exponential backoff for observer reads.
//!
//! The cache itself never retries. An observer opts in through
//! [`QueryOptions::retry`](crate::QueryOptions), which wraps its operation
//! with [`retry_if`] before handing it to the cache, so every waiter on a
//! de-duplicated fetch sees the retried outcome.
//!
//! # Example
//!
//! ```
//! use query_sync::RetryConfig;
//!
//! let query = RetryConfig::query();
//! assert_eq!(query.max_attempts, 3);
//! assert!(query.transport_only);
//!
//! let aggressive = RetryConfig::persistent();
//! assert_eq!(aggressive.max_attempts, 5);
//! assert!(!aggressive.transport_only);
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::error::QueryError;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Only retry [`QueryError::Transport`]; remote answers are final.
    pub transport_only: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::query()
    }
}

impl RetryConfig {
    /// Quick retry for reads: 3 attempts, transport failures only.
    #[must_use]
    pub fn query() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
            max_attempts: 3,
            transport_only: true,
        }
    }

    /// 5 attempts on any error, backoff capped at 30 seconds.
    #[must_use]
    pub fn persistent() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            max_attempts: 5,
            transport_only: false,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
            max_attempts: 3,
            transport_only: false,
        }
    }

    #[must_use]
    pub fn should_retry(&self, err: &QueryError) -> bool {
        !matches!(err, QueryError::Disposed | QueryError::NoRuntime) && (!self.transport_only || err.is_transport())
    }

    /// Delay before attempt `n + 1` given the delay before attempt `n`.
    #[must_use]
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.mul_f64(self.factor).min(self.max_delay)
    }
}

/// Run `operation` until it succeeds, the policy rejects the error, or
/// attempts run out. The last error is returned unchanged.
pub async fn retry_if<F, Fut, T>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, QueryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, QueryError>>,
{
    let mut delay = config.initial_delay;
    let mut attempts = 0;

    loop {
        match operation().await {
            Ok(val) => {
                if attempts > 0 {
                    info!("Operation '{}' succeeded after {} retries", operation_name, attempts);
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if attempts >= config.max_attempts || !config.should_retry(&err) {
                    return Err(err);
                }

                warn!(
                    "Operation '{}' failed (attempt {}/{}): {}. Retrying in {:?}...",
                    operation_name, attempts, config.max_attempts, err, delay
                );

                sleep(delay).await;
                delay = config.next_delay(delay);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_retry_succeeds_first_try() {
        let result = retry_if("test_op", &RetryConfig::test(), || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_if("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                let count = a.fetch_add(1, Ordering::SeqCst) + 1;
                if count < 3 {
                    Err(QueryError::transport(format!("fail {}", count)))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();

        let result: Result<i32, _> = retry_if("test_op", &RetryConfig::test(), || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(QueryError::transport("always fail"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err(), QueryError::transport("always fail"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_transport_only_does_not_retry_remote_errors() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let config = RetryConfig {
            transport_only: true,
            ..RetryConfig::test()
        };

        let result: Result<i32, _> = retry_if("test_op", &config, || {
            let a = attempts_clone.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(QueryError::remote("42501", "permission denied"))
            }
        })
        .await;

        assert_eq!(result.unwrap_err().code(), Some("42501"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disposed_is_never_retried() {
        assert!(!RetryConfig::persistent().should_retry(&QueryError::Disposed));
    }

    #[test]
    fn test_delay_exponential_backoff() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryConfig::query()
        };

        let mut delay = config.initial_delay;
        assert_eq!(delay, Duration::from_millis(100));

        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(200));

        delay = config.next_delay(delay);
        assert_eq!(delay, Duration::from_millis(400));
    }

    #[test]
    fn test_delay_caps_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            factor: 10.0,
            ..RetryConfig::query()
        };

        assert_eq!(config.next_delay(config.initial_delay), Duration::from_secs(5));
    }
}
