// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-observer options.
//!
//! The cache holds no staleness or retry policy of its own; each
//! [`QueryObserver`](crate::QueryObserver) decides when its entry is old
//! enough to refetch and whether its operation retries.
//!
//! # Example
//!
//! ```rust
//! use std::time::Duration;
//! use query_sync::{QueryOptions, RetryConfig};
//!
//! // Default: enabled, always stale, no retry, no polling
//! let opts = QueryOptions::default();
//! assert!(opts.enabled);
//!
//! // Dashboard tile: fresh for 30s, polled every minute
//! let tile = QueryOptions::default()
//!     .with_stale_time(Duration::from_secs(30))
//!     .with_refetch_interval(Duration::from_secs(60))
//!     .with_retry(RetryConfig::query());
//! assert_eq!(tile.refetch_interval, Some(Duration::from_secs(60)));
//!
//! // Waiting on a user id that isn't known yet
//! let deferred = QueryOptions::disabled();
//! assert!(!deferred.enabled);
//! ```

use std::time::Duration;

use crate::config::QueryCacheConfig;
use crate::retry::RetryConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct QueryOptions {
    /// Fetch at all. A disabled observer projects an empty state.
    ///
    /// Default: `true`
    pub enabled: bool,

    /// How long a successful result counts as fresh. A mounted observer
    /// refetches entries older than this.
    ///
    /// Default: zero (every mount refetches)
    pub stale_time: Duration,

    /// Retry policy wrapped around the operation. The cache never retries.
    ///
    /// Default: `None`
    pub retry: Option<RetryConfig>,

    /// Background refetch period while mounted.
    ///
    /// Default: `None`
    pub refetch_interval: Option<Duration>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            stale_time: Duration::ZERO,
            retry: None,
            refetch_interval: None,
        }
    }
}

impl QueryOptions {
    /// Defaults, with `stale_time` taken from the cache configuration.
    #[must_use]
    pub fn from_config(config: &QueryCacheConfig) -> Self {
        Self {
            stale_time: config.default_stale_time(),
            ..Self::default()
        }
    }

    /// Options for an observer that must not fetch until enabled.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Zero disables polling.
    #[must_use]
    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = (!interval.is_zero()).then_some(interval);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = QueryOptions::default();
        assert!(opts.enabled);
        assert_eq!(opts.stale_time, Duration::ZERO);
        assert!(opts.retry.is_none());
        assert!(opts.refetch_interval.is_none());
    }

    #[test]
    fn test_from_config_uses_default_stale_time() {
        let config = QueryCacheConfig {
            default_stale_time_ms: 5_000,
            ..Default::default()
        };
        let opts = QueryOptions::from_config(&config);
        assert_eq!(opts.stale_time, Duration::from_secs(5));
        assert!(opts.enabled);
    }

    #[test]
    fn test_builders() {
        let opts = QueryOptions::disabled()
            .with_enabled(true)
            .with_retry(RetryConfig::persistent())
            .with_refetch_interval(Duration::ZERO);
        assert!(opts.enabled);
        assert_eq!(opts.retry, Some(RetryConfig::persistent()));
        assert!(opts.refetch_interval.is_none());
    }
}
