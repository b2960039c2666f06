// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Invalidation: mark entries stale and replay their last operation when
//! someone is watching.

use std::sync::atomic::Ordering;

use tracing::{debug, warn};

use super::entry::{notify, CacheEvent, CacheEventKind};
use super::QueryCache;
use crate::query_key::QueryKey;

impl QueryCache {
    /// Invalidate `keys`. Returns the number of refetches started or queued.
    ///
    /// - subscribed entry, idle: its last operation runs again immediately
    /// - subscribed entry, fetch in flight: one follow-up fetch is queued for
    ///   when the current one settles
    /// - unsubscribed entry: only marked, so the next observer refetches
    ///   instead of serving it. A fetch in flight at that moment does not
    ///   clear the mark when it settles, and runs a follow-up fetch if a
    ///   subscriber arrived meanwhile
    ///
    /// Unknown keys are ignored. Refetches are not awaited.
    pub fn invalidate(&self, keys: &[QueryKey]) -> usize {
        if self.is_disposed() {
            debug!(keys = keys.len(), "Invalidate on disposed cache ignored");
            return 0;
        }
        keys.iter().filter(|key| self.invalidate_one(key)).count()
    }

    /// Invalidate every cached key that starts with `prefix`.
    pub fn invalidate_matching(&self, prefix: &QueryKey) -> usize {
        let matching: Vec<QueryKey> = self.keys().into_iter().filter(|key| key.starts_with(prefix)).collect();
        debug!(prefix = %prefix, matched = matching.len(), "Invalidating by prefix");
        self.invalidate(&matching)
    }

    /// Returns whether a refetch was started or queued.
    fn invalidate_one(&self, key: &QueryKey) -> bool {
        let Some(slot) = self.inner.entries.get(key).map(|s| s.value().clone()) else {
            return false;
        };

        let (listeners, replay, queued) = {
            let mut slot = slot.lock();
            if slot.evicted {
                return false;
            }
            slot.is_invalidated = true;
            let watched = !slot.listeners.is_empty();
            let mut replay = None;
            let mut queued = false;
            if slot.in_flight.is_some() {
                slot.invalidated_in_flight = true;
                queued = watched;
            } else if watched {
                replay = slot.operation.clone();
            }
            (slot.active_listeners(), replay, queued)
        };

        self.inner.invalidations.fetch_add(1, Ordering::Relaxed);
        notify(listeners, &CacheEvent { key: key.clone(), kind: CacheEventKind::Invalidated });

        let refetched = match replay {
            Some(operation) => match self.start_fetch(key, operation) {
                Ok(_) => true,
                Err(e) => {
                    warn!(key = %key, error = %e, "Refetch after invalidation could not start");
                    false
                }
            },
            None => queued,
        };
        crate::metrics::record_invalidation(key, refetched);
        debug!(key = %key, refetched, queued, "Entry invalidated");
        refetched
    }
}

#[cfg(test)]
mod tests {
    use crate::cache::{CacheEventKind, QueryFn};
    use crate::config::QueryCacheConfig;
    use crate::query_key;
    use crate::QueryCache;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn create_test_cache() -> QueryCache {
        QueryCache::create(QueryCacheConfig { gc_interval_ms: 0, ..Default::default() })
    }

    fn counter_op(calls: Arc<AtomicUsize>) -> QueryFn<usize> {
        QueryFn::new(move || {
            let calls = calls.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(calls.fetch_add(1, Ordering::SeqCst) + 1)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_with_subscriber_refetches() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks", "u1"];
        let _sub = cache.subscribe(&key, |_| {});
        cache.fetch(&key, counter_op(calls.clone())).await.unwrap();

        assert_eq!(cache.invalidate(&[key.clone()]), 1);
        assert!(cache.get::<usize>(&key).unwrap().is_fetching);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let entry = cache.get::<usize>(&key).unwrap();
        assert_eq!(entry.data.as_deref(), Some(&2));
        assert!(!entry.is_invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_without_subscriber_only_marks() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks", "u1"];
        cache.fetch(&key, counter_op(calls.clone())).await.unwrap();

        assert_eq!(cache.invalidate(&[key.clone()]), 0);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = cache.get::<usize>(&key).unwrap();
        assert!(entry.is_invalidated);
        assert!(!entry.is_fetching);
        assert_eq!(entry.data.as_deref(), Some(&1), "stale data is kept");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_during_fetch_queues_one_follow_up() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks"];
        let _sub = cache.subscribe(&key, |_| {});

        let pending = cache.fetch(&key, counter_op(calls.clone()));
        assert_eq!(cache.invalidate(&[key.clone()]), 1);
        assert_eq!(cache.invalidate(&[key.clone()]), 1);
        assert_eq!(*pending.await.unwrap(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2, "queued invalidations collapse into one refetch");
        assert_eq!(cache.get::<usize>(&key).unwrap().data.as_deref(), Some(&2));
    }

    /// Reads the server value when the operation starts, then takes 10ms.
    fn snapshot_op(server: Arc<AtomicUsize>, calls: Arc<AtomicUsize>) -> QueryFn<usize> {
        QueryFn::new(move || {
            let value = server.load(Ordering::SeqCst);
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(value)
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unwatched_invalidation_during_fetch_survives_settle() {
        let cache = create_test_cache();
        let (server, calls) = (Arc::new(AtomicUsize::new(1)), Arc::new(AtomicUsize::new(0)));
        let key = query_key!["tasks", "u1"];

        let pending = cache.fetch(&key, snapshot_op(server.clone(), calls.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        server.store(2, Ordering::SeqCst);
        assert_eq!(cache.invalidate(&[key.clone()]), 0);
        assert_eq!(*pending.await.unwrap(), 1);

        let entry = cache.get::<usize>(&key).unwrap();
        assert_eq!(entry.data.as_deref(), Some(&1));
        assert!(entry.is_invalidated, "the read started before the write");
        assert!(entry.is_stale(Duration::from_secs(60)));
        assert_eq!(calls.load(Ordering::SeqCst), 1, "nobody is watching, nothing refetches");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscriber_arriving_mid_fetch_gets_follow_up() {
        let cache = create_test_cache();
        let (server, calls) = (Arc::new(AtomicUsize::new(1)), Arc::new(AtomicUsize::new(0)));
        let key = query_key!["tasks", "u1"];

        let pending = cache.fetch(&key, snapshot_op(server.clone(), calls.clone()));
        tokio::time::sleep(Duration::from_millis(1)).await;
        server.store(2, Ordering::SeqCst);
        cache.invalidate(&[key.clone()]);
        let _sub = cache.subscribe(&key, |_| {});
        pending.await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let entry = cache.get::<usize>(&key).unwrap();
        assert_eq!(entry.data.as_deref(), Some(&2));
        assert!(!entry.is_invalidated);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_key_is_noop() {
        let cache = create_test_cache();
        assert_eq!(cache.invalidate(&[query_key!["nothing"]]), 0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().invalidations, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_matching_prefix() {
        let cache = create_test_cache();
        for user in ["u1", "u2"] {
            cache.set_data(&query_key!["tasks", user], 0usize).unwrap();
        }
        cache.set_data(&query_key!["profile", "u1"], 0usize).unwrap();

        assert_eq!(cache.invalidate_matching(&query_key!["tasks"]), 0);
        assert!(cache.get::<usize>(&query_key!["tasks", "u1"]).unwrap().is_invalidated);
        assert!(cache.get::<usize>(&query_key!["tasks", "u2"]).unwrap().is_invalidated);
        assert!(!cache.get::<usize>(&query_key!["profile", "u1"]).unwrap().is_invalidated);
        assert_eq!(cache.stats().invalidations, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_event_precedes_refetch() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = cache.subscribe(&key, move |e| seen_clone.lock().push(e.kind));
        cache.fetch(&key, counter_op(Arc::new(AtomicUsize::new(0)))).await.unwrap();
        seen.lock().clear();

        cache.invalidate(&[key.clone()]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *seen.lock(),
            vec![CacheEventKind::Invalidated, CacheEventKind::FetchStarted, CacheEventKind::Succeeded]
        );
    }
}
