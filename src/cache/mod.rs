// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query cache.
//!
//! The [`QueryCache`] is the single source of truth for in-flight and
//! completed reads, keyed by [`QueryKey`]:
//! - one entry per key, created on first read or subscribe
//! - at most one in-flight operation per key (concurrent fetches attach to it)
//! - subscribers notified synchronously after every transition
//! - invalidation replays the last operation for keys that have subscribers
//! - inactive entries evicted after the retention window
//!
//! # Lifecycle
//!
//! There is no global instance. Build one with [`QueryCache::create`] at
//! start-up, pass clones around (they share state), and call
//! [`QueryCache::dispose`] when done.
//!
//! # Example
//!
//! ```rust,no_run
//! use query_sync::{query_key, QueryCache, QueryCacheConfig, QueryFn};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), query_sync::QueryError> {
//! let cache = QueryCache::create(QueryCacheConfig::default());
//! let key = query_key!["tasks", "u1"];
//!
//! let tasks = cache
//!     .fetch(&key, QueryFn::new(|| async { Ok(vec!["write report".to_string()]) }))
//!     .await?;
//! assert_eq!(tasks.len(), 1);
//!
//! cache.dispose();
//! # Ok(())
//! # }
//! ```

mod entry;
mod fetch;
mod invalidate;
mod subscription;

pub use entry::{CacheEntry, CacheEvent, CacheEventKind, Listener, QueryStatus};
pub use fetch::QueryFn;
pub use subscription::Subscription;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::QueryCacheConfig;
use crate::error::QueryError;
use crate::eviction::{EvictionCandidate, RetentionPolicy};
use crate::query_key::QueryKey;

use entry::{notify, AnyData, ListenerSlot, Slot};

/// Counters reported by [`QueryCache::stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently held
    pub entries: usize,
    /// Entries with at least one subscriber
    pub active_entries: usize,
    /// Subscribers across all entries
    pub subscribers: usize,
    /// Operations issued
    pub fetches: u64,
    /// Fetch calls that attached to an in-flight operation
    pub deduplicated: u64,
    /// Fetches that settled with an error
    pub errors: u64,
    /// Entries invalidated
    pub invalidations: u64,
    /// Entries removed by gc
    pub evictions: u64,
}

pub(crate) struct CacheInner {
    pub(crate) config: QueryCacheConfig,
    pub(crate) retention: RetentionPolicy,
    pub(crate) entries: DashMap<QueryKey, Arc<Mutex<Slot>>>,
    pub(crate) next_id: AtomicU64,
    pub(crate) disposed: AtomicBool,
    pub(crate) gc_task: Mutex<Option<JoinHandle<()>>>,
    pub(crate) fetches: AtomicU64,
    pub(crate) deduplicated: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) evictions: AtomicU64,
}

impl Drop for CacheInner {
    fn drop(&mut self) {
        if let Some(task) = self.gc_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Shared handle on a query cache. Cloning is cheap; clones see the same
/// entries.
///
/// # Thread Safety
///
/// `Send + Sync`. Entries live in a `DashMap`; per-entry state sits behind a
/// short mutex that is released before listeners run or anything awaits.
#[derive(Clone)]
pub struct QueryCache {
    pub(crate) inner: Arc<CacheInner>,
}

/// Non-owning handle, used by subscriptions and observers so they never keep
/// a disposed cache alive.
#[derive(Clone)]
pub struct WeakQueryCache {
    inner: Weak<CacheInner>,
}

impl WeakQueryCache {
    #[must_use]
    pub fn upgrade(&self) -> Option<QueryCache> {
        self.inner.upgrade().map(|inner| QueryCache { inner })
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.inner.entries.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl QueryCache {
    /// Create a cache and, when a Tokio runtime is available and
    /// `gc_interval_ms > 0`, start the background sweeper.
    pub fn create(config: QueryCacheConfig) -> Self {
        let retention = RetentionPolicy::from_config(&config);
        let cache = Self {
            inner: Arc::new(CacheInner {
                config,
                retention,
                entries: DashMap::new(),
                next_id: AtomicU64::new(1),
                disposed: AtomicBool::new(false),
                gc_task: Mutex::new(None),
                fetches: AtomicU64::new(0),
                deduplicated: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                invalidations: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        };
        cache.start_sweeper();
        cache
    }

    fn start_sweeper(&self) {
        let Some(period) = self.inner.config.gc_interval() else {
            debug!("Background gc disabled (gc_interval_ms = 0)");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No Tokio runtime at cache creation - background gc disabled, call gc() manually");
            return;
        };

        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.disposed.load(Ordering::Acquire) {
                    break;
                }
                QueryCache { inner }.gc();
            }
        });
        *self.inner.gc_task.lock() = Some(task);
        debug!(period_ms = period.as_millis() as u64, "Background gc started");
    }

    /// Stop the sweeper and drop every entry. In-flight operations run to
    /// completion but their results are not stored. Idempotent.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.inner.gc_task.lock().take() {
            task.abort();
        }

        // Slots are marked under the shard lock, so nothing can lock a slot
        // that has already left the map without seeing `evicted`.
        let mut removed = Vec::new();
        self.inner.entries.retain(|key, slot| {
            let mut slot = slot.lock();
            slot.evicted = true;
            slot.in_flight = None;
            slot.operation = None;
            removed.push((key.clone(), slot.active_listeners()));
            false
        });
        let entries = removed.len();
        for (key, listeners) in removed {
            notify(listeners, &CacheEvent { key, kind: CacheEventKind::Removed });
        }
        crate::metrics::set_cache_entries(0);
        info!(entries, "Query cache disposed");
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache { inner: Arc::downgrade(&self.inner) }
    }

    /// Non-mutating lookup. `None` when the key is unknown or its data was
    /// cached as a different type.
    #[must_use]
    pub fn get<T: Send + Sync + 'static>(&self, key: &QueryKey) -> Option<CacheEntry<T>> {
        let slot = self.existing_slot(key)?;
        let slot = slot.lock();
        if slot.evicted {
            return None;
        }
        let data = match slot.data.clone() {
            Some(any) => match any.downcast::<T>() {
                Ok(data) => Some(data),
                Err(_) => {
                    warn!(key = %key, "Cached data has a different type than requested");
                    crate::metrics::record_error("cache", "type_mismatch");
                    return None;
                }
            },
            None => None,
        };
        Some(slot.snapshot(key.clone(), data))
    }

    #[must_use]
    pub fn contains(&self, key: &QueryKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    /// Keys currently cached.
    #[must_use]
    pub fn keys(&self) -> Vec<QueryKey> {
        self.inner.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Register `listener` for every change of the entry at `key`.
    ///
    /// The entry is created (idle) if it doesn't exist. The returned
    /// [`Subscription`] unsubscribes on [`Subscription::unsubscribe`] or drop.
    pub fn subscribe<F>(&self, key: &QueryKey, listener: F) -> Subscription
    where
        F: Fn(&CacheEvent) + Send + Sync + 'static,
    {
        let id = self.next_id();
        let active = Arc::new(AtomicBool::new(false));
        if self.is_disposed() {
            debug!(key = %key, "Subscribe on disposed cache ignored");
            return Subscription::new(self.downgrade(), key.clone(), id, active);
        }

        active.store(true, Ordering::Release);
        let mut slot = self.lock_slot(key);
        slot.listeners.push(ListenerSlot {
            id,
            active: active.clone(),
            callback: Arc::new(listener),
        });
        slot.inactive_since = None;
        let subscribers = slot.listeners.len();
        drop(slot);

        debug!(key = %key, subscribers, "Subscribed");
        Subscription::new(self.downgrade(), key.clone(), id, active)
    }

    pub(crate) fn remove_listener(&self, key: &QueryKey, id: u64) {
        let Some(slot) = self.existing_slot(key) else { return };
        let mut slot = slot.lock();
        slot.listeners.retain(|l| l.id != id);
        if slot.listeners.is_empty() && slot.inactive_since.is_none() {
            slot.inactive_since = Some(Instant::now());
        }
        debug!(key = %key, subscribers = slot.listeners.len(), "Unsubscribed");
    }

    /// Write `data` directly into the entry (optimistic updates, seeding).
    ///
    /// The entry becomes `Success` and is no longer invalidated. A fetch
    /// already in flight still overwrites it when it settles.
    pub fn set_data<T: Send + Sync + 'static>(&self, key: &QueryKey, data: T) -> Result<Arc<T>, QueryError> {
        let data = Arc::new(data);
        self.set_raw(key, Some(data.clone() as AnyData))?;
        Ok(data)
    }

    /// Replace (or clear) the type-erased data of an entry.
    pub(crate) fn set_raw(&self, key: &QueryKey, data: Option<AnyData>) -> Result<(), QueryError> {
        if self.is_disposed() {
            return Err(QueryError::Disposed);
        }
        let listeners = {
            let mut slot = self.lock_slot(key);
            match data {
                Some(data) => {
                    slot.data = Some(data);
                    slot.status = QueryStatus::Success;
                    slot.error = None;
                    slot.data_updated_at = Some(Instant::now());
                    slot.is_invalidated = false;
                }
                None => {
                    slot.data = None;
                    slot.data_updated_at = None;
                    if slot.in_flight.is_none() {
                        slot.status = QueryStatus::Idle;
                    }
                }
            }
            slot.active_listeners()
        };
        notify(listeners, &CacheEvent { key: key.clone(), kind: CacheEventKind::DataSet });
        Ok(())
    }

    /// Type-erased data of an entry, for optimistic rollback.
    pub(crate) fn raw_data(&self, key: &QueryKey) -> Option<AnyData> {
        let slot = self.existing_slot(key)?;
        let slot = slot.lock();
        if slot.evicted { None } else { slot.data.clone() }
    }

    /// Drop an entry regardless of subscribers. Subscribers get a
    /// `Removed` event; their subscriptions become no-ops.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let Some((_, slot)) = self.inner.entries.remove_if(key, |_, slot| {
            slot.lock().evicted = true;
            true
        }) else {
            return false;
        };
        let listeners = slot.lock().active_listeners();
        notify(listeners, &CacheEvent { key: key.clone(), kind: CacheEventKind::Removed });
        debug!(key = %key, "Entry removed");
        true
    }

    /// Evict inactive entries past the retention window (and beyond the
    /// inactive-entry cap). Returns how many were removed.
    pub fn gc(&self) -> usize {
        let now = Instant::now();
        let candidates: Vec<EvictionCandidate> = self
            .slots()
            .into_iter()
            .map(|(key, slot)| {
                let slot = slot.lock();
                EvictionCandidate {
                    key,
                    subscriber_count: slot.listeners.len(),
                    is_fetching: slot.in_flight.is_some(),
                    inactive_since: slot.inactive_since,
                }
            })
            .collect();

        let victims = self.inner.retention.select_victims(&candidates, now);
        let mut evicted = 0usize;
        for key in &victims {
            // Re-checked under the lock: a subscriber may have arrived since selection.
            let removed = self.inner.entries.remove_if(key, |_, slot| {
                let mut slot = slot.lock();
                if slot.listeners.is_empty() && slot.in_flight.is_none() {
                    slot.evicted = true;
                    true
                } else {
                    false
                }
            });
            if removed.is_some() {
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.inner.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
            crate::metrics::record_eviction(evicted);
            info!(evicted, remaining = self.inner.entries.len(), "Evicted inactive entries");
        }
        crate::metrics::set_cache_entries(self.inner.entries.len());
        evicted
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let mut stats = CacheStats {
            entries: 0,
            fetches: self.inner.fetches.load(Ordering::Relaxed),
            deduplicated: self.inner.deduplicated.load(Ordering::Relaxed),
            errors: self.inner.errors.load(Ordering::Relaxed),
            invalidations: self.inner.invalidations.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            ..Default::default()
        };
        for (_, slot) in self.slots() {
            let subscribers = slot.lock().listeners.len();
            stats.entries += 1;
            stats.subscribers += subscribers;
            if subscribers > 0 {
                stats.active_entries += 1;
            }
        }
        stats
    }

    /// Push entry and subscriber gauges. Call before snapshotting metrics.
    pub fn update_gauge_metrics(&self) {
        let stats = self.stats();
        crate::metrics::set_cache_entries(stats.entries);
        crate::metrics::set_active_subscribers(stats.subscribers);
    }

    // --- Internal helpers ---

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Snapshot of (key, slot) pairs. The map is not borrowed afterwards, so
    /// slots can be locked freely.
    fn slots(&self) -> Vec<(QueryKey, Arc<Mutex<Slot>>)> {
        self.inner
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    fn existing_slot(&self, key: &QueryKey) -> Option<Arc<Mutex<Slot>>> {
        self.inner.entries.get(key).map(|slot| slot.value().clone())
    }

    /// Lock the live slot for `key`, creating it if needed. Retries when the
    /// slot it grabbed was evicted before the lock was acquired.
    pub(crate) fn lock_slot(&self, key: &QueryKey) -> ArcMutexGuard<RawMutex, Slot> {
        loop {
            let slot = self
                .inner
                .entries
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(Slot::new())))
                .value()
                .clone();
            let guard = slot.lock_arc();
            if !guard.evicted {
                return guard;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn create_test_cache() -> QueryCache {
        QueryCache::create(QueryCacheConfig {
            gc_interval_ms: 0,
            ..Default::default()
        })
    }

    #[test]
    fn test_get_unknown_key() {
        let cache = create_test_cache();
        assert!(cache.get::<Vec<String>>(&query_key!["tasks"]).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_subscribe_creates_idle_entry_and_counts() {
        let cache = create_test_cache();
        let key = query_key!["tasks", "u1"];

        let sub_a = cache.subscribe(&key, |_| {});
        let sub_b = cache.subscribe(&key, |_| {});

        let entry = cache.get::<()>(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Idle);
        assert_eq!(entry.subscriber_count, 2);

        sub_a.unsubscribe();
        assert_eq!(cache.get::<()>(&key).unwrap().subscriber_count, 1);
        drop(sub_b);
        assert_eq!(cache.get::<()>(&key).unwrap().subscriber_count, 0);
    }

    #[test]
    fn test_unsubscribe_is_idempotent() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        let keep = cache.subscribe(&key, |_| {});
        let sub = cache.subscribe(&key, |_| {});

        sub.unsubscribe();
        sub.unsubscribe();
        drop(sub);

        assert_eq!(cache.get::<()>(&key).unwrap().subscriber_count, 1);
        assert!(keep.is_active());
    }

    #[test]
    fn test_set_data_notifies_and_reads_back() {
        let cache = create_test_cache();
        let key = query_key!["profile", "u1"];
        let events = Arc::new(AtomicUsize::new(0));
        let events_clone = events.clone();
        let _sub = cache.subscribe(&key, move |event| {
            assert_eq!(event.kind, CacheEventKind::DataSet);
            events_clone.fetch_add(1, Ordering::SeqCst);
        });

        cache.set_data(&key, "Ada".to_string()).unwrap();

        let entry = cache.get::<String>(&key).unwrap();
        assert_eq!(entry.data.as_deref().map(String::as_str), Some("Ada"));
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(events.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_get_with_wrong_type_is_none() {
        let cache = create_test_cache();
        let key = query_key!["profile", "u1"];
        cache.set_data(&key, 42u32).unwrap();

        assert!(cache.get::<String>(&key).is_none());
        assert!(cache.get::<u32>(&key).is_some());
    }

    #[test]
    fn test_remove_notifies_subscribers() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        let removed = Arc::new(AtomicBool::new(false));
        let removed_clone = removed.clone();
        let sub = cache.subscribe(&key, move |event| {
            if event.kind == CacheEventKind::Removed {
                removed_clone.store(true, Ordering::SeqCst);
            }
        });

        assert!(cache.remove(&key));
        assert!(!cache.remove(&key));
        assert!(removed.load(Ordering::SeqCst));
        assert!(!cache.contains(&key));

        // Late unsubscribe must not resurrect the entry
        sub.unsubscribe();
        assert!(!cache.contains(&key));
    }

    #[test]
    fn test_slot_leaving_map_is_already_evicted() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        cache.set_data(&key, 1u8).unwrap();

        // A handle cloned out of the map right before removal, as lock_slot holds it
        let orphan = cache.existing_slot(&key).unwrap();
        assert!(cache.remove(&key));
        assert!(orphan.lock().evicted);

        let fresh = cache.lock_slot(&key);
        assert!(!Arc::ptr_eq(ArcMutexGuard::mutex(&fresh), &orphan));
        assert!(!fresh.evicted);
        drop(fresh);
        assert!(cache.contains(&key));

        let orphan = cache.existing_slot(&key).unwrap();
        cache.dispose();
        assert!(orphan.lock().evicted);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_respects_retention_and_subscribers() {
        let cache = QueryCache::create(QueryCacheConfig {
            gc_time_ms: 1_000,
            gc_interval_ms: 0,
            ..Default::default()
        });
        let idle = query_key!["tasks", "idle"];
        let watched = query_key!["tasks", "watched"];
        cache.set_data(&idle, 1u8).unwrap();
        cache.set_data(&watched, 2u8).unwrap();
        let _sub = cache.subscribe(&watched, |_| {});

        assert_eq!(cache.gc(), 0);

        tokio::time::advance(Duration::from_millis(1_500)).await;
        assert_eq!(cache.gc(), 1);
        assert!(!cache.contains(&idle));
        assert!(cache.contains(&watched));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retention_restarts_when_last_subscriber_leaves() {
        let cache = QueryCache::create(QueryCacheConfig {
            gc_time_ms: 1_000,
            gc_interval_ms: 0,
            ..Default::default()
        });
        let key = query_key!["tasks"];
        let sub = cache.subscribe(&key, |_| {});

        tokio::time::advance(Duration::from_secs(10)).await;
        sub.unsubscribe();
        assert_eq!(cache.gc(), 0, "inactivity starts at unsubscribe, not creation");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(cache.gc(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper_evicts() {
        let cache = QueryCache::create(QueryCacheConfig {
            gc_time_ms: 1_000,
            gc_interval_ms: 500,
            ..Default::default()
        });
        let key = query_key!["tasks"];
        cache.set_data(&key, 1u8).unwrap();

        tokio::time::sleep(Duration::from_millis(2_100)).await;
        assert!(!cache.contains(&key));
    }

    #[tokio::test]
    async fn test_dispose_clears_and_rejects() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        cache.set_data(&key, 1u8).unwrap();

        cache.dispose();
        cache.dispose();

        assert!(cache.is_disposed());
        assert!(cache.is_empty());
        assert_eq!(cache.set_data(&key, 2u8).unwrap_err(), QueryError::Disposed);
        let sub = cache.subscribe(&key, |_| {});
        assert!(!sub.is_active());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_stats_counts_subscribers() {
        let cache = create_test_cache();
        let _a = cache.subscribe(&query_key!["tasks"], |_| {});
        let _b = cache.subscribe(&query_key!["tasks"], |_| {});
        cache.set_data(&query_key!["profile"], 1u8).unwrap();

        let stats = cache.stats();
        assert_eq!(stats.entries, 2);
        assert_eq!(stats.active_entries, 1);
        assert_eq!(stats.subscribers, 2);
    }

    #[test]
    fn test_weak_handle_does_not_keep_cache_alive() {
        let cache = create_test_cache();
        let weak = cache.downgrade();
        assert!(weak.upgrade().is_some());
        drop(cache);
        assert!(weak.upgrade().is_none());
    }
}
