//! Entry state: the public snapshot types and the internal slot behind them.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use tokio::time::Instant;

use crate::error::QueryError;
use crate::query_key::QueryKey;

pub(crate) type AnyData = Arc<dyn Any + Send + Sync>;
pub(crate) type FetchResult = Result<AnyData, QueryError>;
pub(crate) type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;
pub(crate) type ErasedOp = Arc<dyn Fn() -> BoxFuture<'static, FetchResult> + Send + Sync>;

/// Callback registered through [`super::QueryCache::subscribe`].
pub type Listener = Arc<dyn Fn(&CacheEvent) + Send + Sync>;

/// Fetch status of an entry.
///
/// `Loading` is reported for background refetches too; consumers that want
/// the "nothing to show yet" signal should look at
/// [`QueryState::is_loading`](crate::QueryState), which also requires the
/// absence of data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
    /// Created by a subscriber, never fetched
    #[default]
    Idle,
    /// A fetch is in flight
    Loading,
    /// Last fetch succeeded
    Success,
    /// Last fetch failed (data may still hold the last good value)
    Error,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Loading => write!(f, "loading"),
            Self::Success => write!(f, "success"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// What changed on an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheEventKind {
    FetchStarted,
    Succeeded,
    Failed,
    Invalidated,
    DataSet,
    Removed,
}

/// Notification delivered to subscribers, after the entry lock is released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEvent {
    pub key: QueryKey,
    pub kind: CacheEventKind,
}

/// Point-in-time snapshot of one entry, typed by the caller.
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub key: QueryKey,
    pub data: Option<Arc<T>>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    /// When `data` was last written by a successful fetch or `set_data`
    pub last_fetched_at: Option<Instant>,
    pub error_updated_at: Option<Instant>,
    pub subscriber_count: usize,
    /// Invalidated since the last successful fetch
    pub is_invalidated: bool,
    pub is_fetching: bool,
    /// Operations actually issued for this key (de-duplicated calls excluded)
    pub fetch_count: u64,
}

impl<T> Clone for CacheEntry<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            last_fetched_at: self.last_fetched_at,
            error_updated_at: self.error_updated_at,
            subscriber_count: self.subscriber_count,
            is_invalidated: self.is_invalidated,
            is_fetching: self.is_fetching,
            fetch_count: self.fetch_count,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Whether an observer with `stale_time` should refetch this entry.
    #[must_use]
    pub fn is_stale(&self, stale_time: Duration) -> bool {
        if self.is_invalidated {
            return true;
        }
        match self.last_fetched_at {
            Some(at) => at.elapsed() >= stale_time,
            None => true,
        }
    }
}

pub(crate) struct ListenerSlot {
    pub(crate) id: u64,
    pub(crate) active: Arc<AtomicBool>,
    pub(crate) callback: Listener,
}

pub(crate) struct InFlight {
    pub(crate) id: u64,
    pub(crate) future: SharedFetch,
}

/// Mutable state behind one key. Guarded by a `parking_lot::Mutex`; never
/// held across an `.await` or while listeners run.
pub(crate) struct Slot {
    pub(crate) status: QueryStatus,
    pub(crate) data: Option<AnyData>,
    pub(crate) error: Option<QueryError>,
    pub(crate) data_updated_at: Option<Instant>,
    pub(crate) error_updated_at: Option<Instant>,
    pub(crate) is_invalidated: bool,
    pub(crate) listeners: Vec<ListenerSlot>,
    pub(crate) in_flight: Option<InFlight>,
    /// Invalidated while a fetch was in flight: that fetch may have read
    /// pre-write data, so its success must not clear `is_invalidated`
    pub(crate) invalidated_in_flight: bool,
    /// Last operation used, replayed by invalidation
    pub(crate) operation: Option<ErasedOp>,
    /// `Some` iff there are no listeners
    pub(crate) inactive_since: Option<Instant>,
    pub(crate) fetch_count: u64,
    /// Removed from the map; late writers must not resurrect it
    pub(crate) evicted: bool,
}

impl Slot {
    pub(crate) fn new() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            data_updated_at: None,
            error_updated_at: None,
            is_invalidated: false,
            listeners: Vec::new(),
            in_flight: None,
            invalidated_in_flight: false,
            operation: None,
            inactive_since: Some(Instant::now()),
            fetch_count: 0,
            evicted: false,
        }
    }

    pub(crate) fn active_listeners(&self) -> Vec<(Arc<AtomicBool>, Listener)> {
        self.listeners
            .iter()
            .filter(|l| l.active.load(Ordering::Acquire))
            .map(|l| (l.active.clone(), l.callback.clone()))
            .collect()
    }

    pub(crate) fn snapshot<T>(&self, key: QueryKey, data: Option<Arc<T>>) -> CacheEntry<T> {
        CacheEntry {
            key,
            data,
            status: self.status,
            error: self.error.clone(),
            last_fetched_at: self.data_updated_at,
            error_updated_at: self.error_updated_at,
            subscriber_count: self.listeners.len(),
            is_invalidated: self.is_invalidated,
            is_fetching: self.in_flight.is_some(),
            fetch_count: self.fetch_count,
        }
    }
}

/// Run listeners collected under the lock. Listeners unsubscribed in the
/// meantime are skipped.
pub(crate) fn notify(listeners: Vec<(Arc<AtomicBool>, Listener)>, event: &CacheEvent) {
    for (active, callback) in listeners {
        if active.load(Ordering::Acquire) {
            callback(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_key;

    #[test]
    fn test_status_display() {
        assert_eq!(QueryStatus::Idle.to_string(), "idle");
        assert_eq!(QueryStatus::Loading.to_string(), "loading");
        assert_eq!(QueryStatus::Success.to_string(), "success");
        assert_eq!(QueryStatus::Error.to_string(), "error");
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_staleness() {
        let mut slot = Slot::new();
        let never_fetched: CacheEntry<()> = slot.snapshot(query_key!["tasks"], None);
        assert!(never_fetched.is_stale(Duration::from_secs(60)));

        slot.data_updated_at = Some(Instant::now());
        let fresh: CacheEntry<()> = slot.snapshot(query_key!["tasks"], None);
        assert!(!fresh.is_stale(Duration::from_secs(60)));
        assert!(fresh.is_stale(Duration::ZERO));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(fresh.is_stale(Duration::from_secs(60)));

        slot.data_updated_at = Some(Instant::now());
        slot.is_invalidated = true;
        let invalidated: CacheEntry<()> = slot.snapshot(query_key!["tasks"], None);
        assert!(invalidated.is_stale(Duration::from_secs(60)));
    }

    #[test]
    fn test_inactive_listeners_are_skipped() {
        use std::sync::atomic::AtomicUsize;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut slot = Slot::new();
        for (id, active) in [(1, true), (2, false)] {
            let calls = calls.clone();
            slot.listeners.push(ListenerSlot {
                id,
                active: Arc::new(AtomicBool::new(active)),
                callback: Arc::new(move |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                }),
            });
        }

        let event = CacheEvent { key: query_key!["tasks"], kind: CacheEventKind::DataSet };
        notify(slot.active_listeners(), &event);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
