// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Fetching: operation handles, request de-duplication and settlement.
//!
//! A fetch registers its in-flight future on the entry *at call time*, before
//! anything is awaited, so two `fetch` calls issued back-to-back share one
//! operation even if neither has been polled yet. The shared future is driven
//! by a spawned task: dropping a caller's future never cancels the request,
//! and settlement (state transition + notifications) happens exactly once.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::QueryError;
use crate::query_key::QueryKey;
use crate::remote::{RemoteResponse, TransportError};
use crate::retry::{retry_if, RetryConfig};

use super::entry::{notify, AnyData, CacheEvent, CacheEventKind, ErasedOp, FetchResult, InFlight, QueryStatus, SharedFetch};
use super::QueryCache;

/// A read operation: `() -> Future<Result<T, QueryError>>`.
///
/// Cloning is cheap. The cache keeps the last operation used for each key
/// so invalidation can replay it.
pub struct QueryFn<T> {
    inner: Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>,
}

impl<T> Clone for QueryFn<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> std::fmt::Debug for QueryFn<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("QueryFn")
    }
}

impl<T: Send + 'static> QueryFn<T> {
    pub fn new<F, Fut>(operation: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        Self { inner: Arc::new(move || operation().boxed()) }
    }

    /// Adapt a call following the remote `(data, error)` contract.
    pub fn from_remote<F, Fut>(call: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteResponse<T>, TransportError>> + Send + 'static,
    {
        Self::new(move || {
            let response = call();
            async move { RemoteResponse::settle(response.await) }
        })
    }

    /// Invoke the operation once, outside the cache.
    pub fn call(&self) -> BoxFuture<'static, Result<T, QueryError>> {
        (self.inner)()
    }

    /// Post-process the result (typically decoding JSON into a resource type).
    pub fn map<U, M>(self, mapper: M) -> QueryFn<U>
    where
        U: Send + 'static,
        M: Fn(T) -> Result<U, QueryError> + Send + Sync + 'static,
    {
        let mapper = Arc::new(mapper);
        QueryFn::new(move || {
            let call = self.call();
            let mapper = mapper.clone();
            async move { mapper(call.await?) }
        })
    }

    /// Wrap in a retry policy. The cache still sees a single operation.
    pub fn with_retry(self, name: impl Into<String>, config: RetryConfig) -> Self {
        let name: Arc<str> = name.into().into();
        let config = Arc::new(config);
        QueryFn::new(move || {
            let op = self.clone();
            let name = name.clone();
            let config = config.clone();
            async move { retry_if(&name, &config, || op.call()).await }
        })
    }
}

impl<T: Send + Sync + 'static> QueryFn<T> {
    pub(crate) fn erase(&self) -> ErasedOp {
        let op = self.clone();
        Arc::new(move || {
            let call = op.call();
            async move { call.await.map(|data| Arc::new(data) as AnyData) }.boxed()
        })
    }
}

pub(crate) fn downcast<T: Send + Sync + 'static>(key: &QueryKey, data: AnyData) -> Result<Arc<T>, QueryError> {
    data.downcast::<T>().map_err(|_: Arc<dyn Any + Send + Sync>| {
        warn!(key = %key, "Fetched data has a different type than requested");
        crate::metrics::record_error("fetch", "type_mismatch");
        QueryError::TypeMismatch { key: key.to_string() }
    })
}

impl QueryCache {
    /// Fetch `key` with `operation`, or attach to the fetch already in
    /// flight for it.
    ///
    /// The de-duplication decision is made when this method is called, not
    /// when the returned future is first polled. Must be called from within
    /// a Tokio runtime.
    ///
    /// On success the entry becomes `Success` with the new data; on error it
    /// becomes `Error` and keeps whatever data it had. Subscribers are
    /// notified after each transition. The cache never retries.
    pub fn fetch<T: Send + Sync + 'static>(
        &self,
        key: &QueryKey,
        operation: QueryFn<T>,
    ) -> impl Future<Output = Result<Arc<T>, QueryError>> + Send + 'static {
        let started = self.start_fetch(key, operation.erase());
        let key = key.clone();
        async move {
            let data = started?.await?;
            downcast::<T>(&key, data)
        }
    }

    /// Start a fetch without waiting for it (no-op if one is in flight).
    pub fn prefetch<T: Send + Sync + 'static>(&self, key: &QueryKey, operation: QueryFn<T>) -> Result<(), QueryError> {
        self.start_fetch(key, operation.erase()).map(|_| ())
    }

    pub(crate) fn start_fetch(&self, key: &QueryKey, operation: ErasedOp) -> Result<SharedFetch, QueryError> {
        if self.is_disposed() {
            return Err(QueryError::Disposed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueryError::NoRuntime)?;

        let mut slot = self.lock_slot(key);
        if let Some(ref in_flight) = slot.in_flight {
            let shared = in_flight.future.clone();
            drop(slot);
            self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
            crate::metrics::record_dedup(key);
            debug!(key = %key, "Attached to in-flight fetch");
            return Ok(shared);
        }

        let operation_for_replay = operation.clone();
        let fetch_id = self.next_id();
        let started_at = Instant::now();
        let cache = self.downgrade();
        let settle_key = key.clone();
        let shared = async move {
            let result: FetchResult = AssertUnwindSafe(operation())
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(QueryError::transport("query operation panicked")));
            if let Some(cache) = cache.upgrade() {
                cache.settle(&settle_key, fetch_id, &result, started_at);
            }
            result
        }
        .boxed()
        .shared();

        // Only the operation that actually runs is kept for replay.
        slot.operation = Some(operation_for_replay);
        slot.in_flight = Some(InFlight { id: fetch_id, future: shared.clone() });
        slot.status = QueryStatus::Loading;
        slot.fetch_count += 1;
        let has_data = slot.data.is_some();
        let listeners = slot.active_listeners();
        drop(slot);

        runtime.spawn(shared.clone());

        self.inner.fetches.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_fetch(key);
        debug!(key = %key, fetch_id, background = has_data, "Fetch started");
        notify(listeners, &CacheEvent { key: key.clone(), kind: CacheEventKind::FetchStarted });
        Ok(shared)
    }

    /// Apply a fetch result. Ignored if the entry was removed or a newer
    /// fetch replaced this one.
    fn settle(&self, key: &QueryKey, fetch_id: u64, result: &FetchResult, started_at: Instant) {
        let Some(slot) = self.inner.entries.get(key).map(|s| s.value().clone()) else {
            debug!(key = %key, fetch_id, "Fetch settled after entry was removed");
            return;
        };
        let mut slot = slot.lock();
        if slot.evicted || slot.in_flight.as_ref().map(|f| f.id) != Some(fetch_id) {
            debug!(key = %key, fetch_id, "Stale fetch result ignored");
            return;
        }

        let now = Instant::now();
        slot.in_flight = None;
        let invalidated_in_flight = std::mem::take(&mut slot.invalidated_in_flight);
        let kind = match result {
            Ok(data) => {
                slot.data = Some(data.clone());
                slot.error = None;
                slot.status = QueryStatus::Success;
                slot.data_updated_at = Some(now);
                slot.is_invalidated = invalidated_in_flight;
                CacheEventKind::Succeeded
            }
            Err(err) => {
                slot.error = Some(err.clone());
                slot.status = QueryStatus::Error;
                slot.error_updated_at = Some(now);
                CacheEventKind::Failed
            }
        };
        if slot.listeners.is_empty() {
            slot.inactive_since = Some(now);
        }
        let follow_up = if invalidated_in_flight && !slot.listeners.is_empty() {
            slot.operation.clone()
        } else {
            None
        };
        let kept_data = slot.data.is_some();
        let listeners = slot.active_listeners();
        drop(slot);

        let elapsed = now.saturating_duration_since(started_at);
        match result {
            Ok(_) => {
                crate::metrics::record_settled(key, "success", elapsed);
                debug!(key = %key, fetch_id, elapsed_ms = elapsed.as_millis() as u64, "Fetch succeeded");
            }
            Err(err) => {
                self.inner.errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_settled(key, "error", elapsed);
                crate::metrics::record_error("fetch", err.kind());
                warn!(key = %key, fetch_id, error = %err, kept_data, "Fetch failed");
            }
        }

        notify(listeners, &CacheEvent { key: key.clone(), kind });

        if let Some(operation) = follow_up {
            debug!(key = %key, "Running refetch queued by invalidation");
            if let Err(e) = self.start_fetch(key, operation) {
                warn!(key = %key, error = %e, "Queued refetch could not start");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueryCacheConfig;
    use crate::query_key;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn create_test_cache() -> QueryCache {
        QueryCache::create(QueryCacheConfig { gc_interval_ms: 0, ..Default::default() })
    }

    fn counting_op(calls: Arc<AtomicUsize>, delay_ms: u64) -> QueryFn<Vec<String>> {
        QueryFn::new(move || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(vec![format!("call {n}")])
            }
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_fetches_share_one_call() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks", "u1"];

        let first = cache.fetch(&key, counting_op(calls.clone(), 50));
        let second = cache.fetch(&key, counting_op(calls.clone(), 50));
        let (a, b) = tokio::join!(first, second);

        let (a, b) = (a.unwrap(), b.unwrap());
        assert!(Arc::ptr_eq(&a, &b), "both callers get the same Arc");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().deduplicated, 1);
        assert_eq!(cache.get::<Vec<String>>(&key).unwrap().fetch_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_fetches_call_again() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks"];

        cache.fetch(&key, counting_op(calls.clone(), 1)).await.unwrap();
        let second = cache.fetch(&key, counting_op(calls.clone(), 1)).await.unwrap();

        assert_eq!(second.as_slice(), ["call 2"]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_transitions_and_notifications() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = cache.subscribe(&key, move |event| seen_clone.lock().push(event.kind));

        let pending = cache.fetch(&key, counting_op(Arc::new(AtomicUsize::new(0)), 10));
        assert_eq!(cache.get::<Vec<String>>(&key).unwrap().status, QueryStatus::Loading);
        assert!(cache.get::<Vec<String>>(&key).unwrap().is_fetching);

        pending.await.unwrap();
        let entry = cache.get::<Vec<String>>(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(entry.last_fetched_at.is_some());
        assert_eq!(*seen.lock(), vec![CacheEventKind::FetchStarted, CacheEventKind::Succeeded]);
    }

    #[tokio::test]
    async fn test_error_keeps_last_good_data() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        cache.fetch(&key, QueryFn::new(|| async { Ok(vec![1, 2, 3]) })).await.unwrap();

        let err = cache
            .fetch(&key, QueryFn::<Vec<i32>>::new(|| async { Err(QueryError::remote("500", "boom")) }))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::remote("500", "boom"));

        let entry = cache.get::<Vec<i32>>(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Error);
        assert_eq!(entry.error, Some(QueryError::remote("500", "boom")));
        assert_eq!(entry.data.as_deref(), Some(&vec![1, 2, 3]));
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_success_clears_error() {
        let cache = create_test_cache();
        let key = query_key!["tasks"];
        let _ = cache
            .fetch(&key, QueryFn::<u8>::new(|| async { Err(QueryError::transport("offline")) }))
            .await;
        cache.fetch(&key, QueryFn::new(|| async { Ok(7u8) })).await.unwrap();

        let entry = cache.get::<u8>(&key).unwrap();
        assert_eq!(entry.status, QueryStatus::Success);
        assert!(entry.error.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_caller_does_not_cancel_fetch() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let key = query_key!["tasks"];

        drop(cache.fetch(&key, counting_op(calls.clone(), 20)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get::<Vec<String>>(&key).unwrap().status, QueryStatus::Success);
    }

    #[tokio::test]
    async fn test_panicking_operation_becomes_transport_error() {
        let cache = create_test_cache();
        let key = query_key!["insights"];
        let err = cache
            .fetch(&key, QueryFn::<u8>::new(|| async {
                let missing: Option<u8> = None;
                Ok(missing.expect("bug in operation"))
            }))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(cache.get::<u8>(&key).unwrap().status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_mismatch_on_shared_fetch() {
        let cache = create_test_cache();
        let key = query_key!["profile"];
        let as_u8 = cache.fetch(&key, QueryFn::new(|| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1u8)
        }));
        let as_string = cache.fetch(&key, QueryFn::new(|| async { Ok(String::from("x")) }));

        let (a, b) = tokio::join!(as_u8, as_string);
        assert_eq!(*a.unwrap(), 1);
        assert!(matches!(b, Err(QueryError::TypeMismatch { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_joined_fetch_of_other_type_keeps_replay_operation() {
        let cache = create_test_cache();
        let key = query_key!["profile"];
        let _sub = cache.subscribe(&key, |_| {});
        let as_u8 = cache.fetch(&key, QueryFn::new(|| async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(1u8)
        }));
        let as_string = cache.fetch(&key, QueryFn::new(|| async { Ok(String::from("x")) }));
        let (_, b) = tokio::join!(as_u8, as_string);
        assert!(matches!(b, Err(QueryError::TypeMismatch { .. })));

        assert_eq!(cache.invalidate(&[key.clone()]), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;

        let entry = cache.get::<u8>(&key).expect("replayed operation still yields u8");
        assert_eq!(entry.data.as_deref(), Some(&1));
        assert_eq!(entry.status, QueryStatus::Success);
        assert_eq!(entry.fetch_count, 2);
    }

    #[tokio::test]
    async fn test_fetch_after_dispose() {
        let cache = create_test_cache();
        cache.dispose();
        let err = cache
            .fetch(&query_key!["tasks"], QueryFn::new(|| async { Ok(1u8) }))
            .await
            .unwrap_err();
        assert_eq!(err, QueryError::Disposed);
    }

    #[test]
    fn test_fetch_outside_runtime() {
        let cache = create_test_cache();
        let pending = cache.fetch(&query_key!["tasks"], QueryFn::new(|| async { Ok(1u8) }));
        let err = futures::executor::block_on(pending).unwrap_err();
        assert_eq!(err, QueryError::NoRuntime);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_from_remote_and_map() {
        let op = QueryFn::from_remote(|| async {
            Ok::<_, TransportError>(RemoteResponse::ok(serde_json::json!([{"id": "t1"}])))
        })
        .map(|value| crate::remote::decode::<Vec<serde_json::Value>>(value));

        assert_eq!(op.call().await.unwrap().len(), 1);

        let failing = QueryFn::<u8>::from_remote(|| async { Err(TransportError("dns".into())) });
        assert_eq!(failing.call().await.unwrap_err(), QueryError::transport("dns"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_is_one_fetch_for_the_cache() {
        let cache = create_test_cache();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let op = QueryFn::new(move || {
            let calls = calls_clone.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(QueryError::transport("flaky"))
                } else {
                    Ok(5u8)
                }
            }
        })
        .with_retry("tasks", RetryConfig::query());

        let value = cache.fetch(&query_key!["tasks"], op).await.unwrap();
        assert_eq!(*value, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.stats().fetches, 1);
    }
}
