// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the query cache.
//!
//! # Example
//!
//! ```
//! use query_sync::QueryCacheConfig;
//! use std::time::Duration;
//!
//! // Minimal config (uses defaults)
//! let config = QueryCacheConfig::default();
//! assert_eq!(config.gc_time(), Duration::from_secs(300)); // 5 minutes
//!
//! // Tuned config
//! let config = QueryCacheConfig {
//!     gc_time_ms: 30_000,
//!     default_stale_time_ms: 5_000,
//!     max_inactive_entries: Some(500),
//!     ..Default::default()
//! };
//! assert_eq!(config.default_stale_time(), Duration::from_secs(5));
//! ```

use std::time::Duration;
use serde::Deserialize;

/// Configuration for the query cache.
///
/// All fields have defaults, so an empty JSON object deserializes to
/// [`QueryCacheConfig::default()`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QueryCacheConfig {
    /// Retention window for entries with no subscribers (default: 5 minutes)
    #[serde(default = "default_gc_time_ms")]
    pub gc_time_ms: u64,

    /// How often the background sweeper runs (0 = no sweeper, call `gc()` yourself)
    #[serde(default = "default_gc_interval_ms")]
    pub gc_interval_ms: u64,

    /// Stale time applied to observers that don't set their own (default: 0)
    #[serde(default)]
    pub default_stale_time_ms: u64,

    /// Upper bound on inactive entries kept around (None = unbounded)
    #[serde(default)]
    pub max_inactive_entries: Option<usize>,
}

fn default_gc_time_ms() -> u64 { 5 * 60 * 1000 } // 5 minutes
fn default_gc_interval_ms() -> u64 { 60 * 1000 }

impl Default for QueryCacheConfig {
    fn default() -> Self {
        Self {
            gc_time_ms: default_gc_time_ms(),
            gc_interval_ms: default_gc_interval_ms(),
            default_stale_time_ms: 0,
            max_inactive_entries: None,
        }
    }
}

impl QueryCacheConfig {
    #[must_use]
    pub fn gc_time(&self) -> Duration {
        Duration::from_millis(self.gc_time_ms)
    }

    /// Sweeper period, `None` when the sweeper is disabled.
    #[must_use]
    pub fn gc_interval(&self) -> Option<Duration> {
        (self.gc_interval_ms > 0).then(|| Duration::from_millis(self.gc_interval_ms))
    }

    #[must_use]
    pub fn default_stale_time(&self) -> Duration {
        Duration::from_millis(self.default_stale_time_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: QueryCacheConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QueryCacheConfig::default());
    }

    #[test]
    fn test_partial_json_overrides() {
        let config: QueryCacheConfig =
            serde_json::from_str(r#"{"gc_time_ms": 1000, "max_inactive_entries": 10}"#).unwrap();
        assert_eq!(config.gc_time(), Duration::from_secs(1));
        assert_eq!(config.max_inactive_entries, Some(10));
        assert_eq!(config.gc_interval(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_interval_disables_sweeper() {
        let config = QueryCacheConfig { gc_interval_ms: 0, ..Default::default() };
        assert_eq!(config.gc_interval(), None);
    }
}
