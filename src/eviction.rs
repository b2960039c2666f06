// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retention policy for inactive cache entries.
//!
//! An entry is *inactive* once its last subscriber leaves (or if it was
//! fetched without ever being subscribed). Inactive entries survive for
//! `gc_time` so a consumer that comes back quickly still gets cached data;
//! after that the sweeper drops them. With `max_inactive_entries` set, the
//! longest-inactive entries beyond the cap go first, regardless of age.
//!
//! Entries with subscribers or an in-flight fetch are never selected.

use std::time::Duration;
use tokio::time::Instant;

use crate::config::QueryCacheConfig;
use crate::query_key::QueryKey;

/// Entry metadata for eviction selection
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: QueryKey,
    pub subscriber_count: usize,
    pub is_fetching: bool,
    /// `None` while the entry has subscribers.
    pub inactive_since: Option<Instant>,
}

impl EvictionCandidate {
    fn idle_for(&self, now: Instant) -> Option<Duration> {
        if self.subscriber_count > 0 || self.is_fetching {
            return None;
        }
        self.inactive_since.map(|since| now.saturating_duration_since(since))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub gc_time: Duration,
    pub max_inactive_entries: Option<usize>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::from_config(&QueryCacheConfig::default())
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn from_config(config: &QueryCacheConfig) -> Self {
        Self {
            gc_time: config.gc_time(),
            max_inactive_entries: config.max_inactive_entries,
        }
    }

    /// Select keys to evict: every expired inactive entry, plus the oldest
    /// inactive entries beyond the cap.
    #[must_use]
    pub fn select_victims(&self, candidates: &[EvictionCandidate], now: Instant) -> Vec<QueryKey> {
        let mut inactive: Vec<(&EvictionCandidate, Duration)> = candidates
            .iter()
            .filter_map(|c| c.idle_for(now).map(|idle| (c, idle)))
            .collect();

        // Longest idle first
        inactive.sort_by(|a, b| b.1.cmp(&a.1));

        let overflow = self
            .max_inactive_entries
            .map_or(0, |cap| inactive.len().saturating_sub(cap));

        inactive
            .into_iter()
            .enumerate()
            .filter(|(rank, (_, idle))| *rank < overflow || *idle >= self.gc_time)
            .map(|(_, (c, _))| c.key.clone())
            .collect()
    }
}
