// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Mutations: one write, then invalidation of the reads it affects.
//!
//! [`Mutation::mutate`] returns the write's `Result`; callbacks are optional
//! sugar through [`Mutation::mutate_with`]. On success the declared keys are
//! invalidated (observers refetch in the background; the mutation does not
//! wait for them). On failure the cache is left as it was and the error is
//! returned unchanged.
//!
//! # Shared state
//!
//! Several calls may run at once on the same `Mutation`. Each call's result
//! is its own, but [`MutationState`] follows the most recently *started*
//! call: an older call finishing late never overwrites it.
//!
//! # Optimistic updates
//!
//! [`Mutation::optimistic`] writes a provisional value into the cache before
//! the write runs. A failed write restores the previous value (unless a
//! fetch has replaced the provisional one since); a successful write
//! invalidates the key so the real data replaces it.

use std::any::Any;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::cache::QueryCache;
use crate::error::QueryError;
use crate::query_key::QueryKey;
use crate::remote::{RemoteResponse, TransportError};

type AnyData = Arc<dyn Any + Send + Sync>;
type WriteFn<V, T> = Arc<dyn Fn(V) -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;
type KeysFn<V, T> = Arc<dyn Fn(&V, &T) -> Vec<QueryKey> + Send + Sync>;
type ApplyFn<V> = Arc<dyn Fn(Option<AnyData>, &V) -> Option<AnyData> + Send + Sync>;

/// Shared, last-call-wins view of a [`Mutation`].
#[derive(Debug)]
pub struct MutationState<T> {
    pub is_pending: bool,
    pub is_error: bool,
    pub error: Option<QueryError>,
    /// Result of the latest successful call
    pub data: Option<Arc<T>>,
}

impl<T> Clone for MutationState<T> {
    fn clone(&self) -> Self {
        Self {
            is_pending: self.is_pending,
            is_error: self.is_error,
            error: self.error.clone(),
            data: self.data.clone(),
        }
    }
}

impl<T> Default for MutationState<T> {
    fn default() -> Self {
        Self {
            is_pending: false,
            is_error: false,
            error: None,
            data: None,
        }
    }
}

impl<T> MutationState<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        !self.is_pending && !self.is_error && self.data.is_some()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.is_pending && !self.is_error && self.data.is_none()
    }
}

/// Per-call callbacks for [`Mutation::mutate_with`].
pub struct MutateCallbacks<T> {
    on_success: Option<Box<dyn FnOnce(&Arc<T>) + Send>>,
    on_error: Option<Box<dyn FnOnce(&QueryError) + Send>>,
}

impl<T> Default for MutateCallbacks<T> {
    fn default() -> Self {
        Self { on_success: None, on_error: None }
    }
}

impl<T> MutateCallbacks<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs after the declared keys were invalidated.
    #[must_use]
    pub fn on_success(mut self, callback: impl FnOnce(&Arc<T>) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    #[must_use]
    pub fn on_error(mut self, callback: impl FnOnce(&QueryError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }
}

struct OptimisticUpdate<V> {
    key: QueryKey,
    apply: ApplyFn<V>,
}

impl<V> Clone for OptimisticUpdate<V> {
    fn clone(&self) -> Self {
        Self { key: self.key.clone(), apply: self.apply.clone() }
    }
}

/// What an optimistic write replaced, for rollback.
struct Provisional {
    key: QueryKey,
    previous: Option<AnyData>,
    written: AnyData,
}

struct MutationCore<T> {
    latest: AtomicU64,
    state: watch::Sender<MutationState<T>>,
}

impl<T> MutationCore<T> {
    /// Apply `change` only if `call` is still the most recent call.
    fn update(&self, call: u64, change: impl FnOnce(&mut MutationState<T>)) {
        self.state.send_if_modified(|state| {
            if self.latest.load(Ordering::Acquire) != call {
                return false;
            }
            change(state);
            true
        });
    }
}

/// Undoes an abandoned call when the caller drops the `mutate` future
/// early: clears `is_pending` and rolls back optimistic writes. The write
/// may or may not have reached the store, so the touched keys are also
/// invalidated.
struct PendingGuard<'a, T> {
    core: &'a MutationCore<T>,
    cache: &'a QueryCache,
    call: u64,
    provisional: Vec<Provisional>,
    armed: bool,
}

impl<T> PendingGuard<'_, T> {
    /// The call settled; hand back the optimistic writes.
    fn disarm(&mut self) -> Vec<Provisional> {
        self.armed = false;
        std::mem::take(&mut self.provisional)
    }
}

impl<T> Drop for PendingGuard<'_, T> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.core.update(self.call, |state| state.is_pending = false);
        let provisional = std::mem::take(&mut self.provisional);
        if provisional.is_empty() {
            return;
        }
        let keys: Vec<QueryKey> = provisional.iter().map(|p| p.key.clone()).collect();
        rollback(self.cache, provisional);
        self.cache.invalidate(&keys);
        debug!(call = self.call, keys = keys.len(), "Abandoned mutation rolled back");
    }
}

/// Restore what optimistic writes replaced, unless something newer has
/// replaced the provisional value since.
fn rollback(cache: &QueryCache, provisional: Vec<Provisional>) {
    for Provisional { key, previous, written } in provisional {
        let untouched = cache
            .raw_data(&key)
            .is_some_and(|current| Arc::ptr_eq(&current, &written));
        if !untouched {
            debug!(key = %key, "Optimistic value already replaced, no rollback");
            continue;
        }
        if let Err(e) = cache.set_raw(&key, previous) {
            debug!(key = %key, error = %e, "Rollback skipped");
        }
    }
}

/// A write operation bound to a cache.
///
/// Cloning is cheap; clones share the same [`MutationState`].
///
/// # Example
///
/// ```rust,no_run
/// use query_sync::{query_key, Mutation, QueryCache, QueryCacheConfig};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), query_sync::QueryError> {
/// let cache = QueryCache::create(QueryCacheConfig::default());
/// let add_task = Mutation::new(&cache, |title: String| async move { Ok(title) })
///     .invalidates([query_key!["tasks", "u1"]]);
///
/// let created = add_task.mutate("write report".to_string()).await?;
/// assert_eq!(created.as_str(), "write report");
/// # Ok(())
/// # }
/// ```
pub struct Mutation<V, T> {
    cache: QueryCache,
    operation: WriteFn<V, T>,
    invalidates: Vec<QueryKey>,
    invalidates_with: Option<KeysFn<V, T>>,
    optimistic: Vec<OptimisticUpdate<V>>,
    core: Arc<MutationCore<T>>,
}

impl<V, T> Clone for Mutation<V, T> {
    fn clone(&self) -> Self {
        Self {
            cache: self.cache.clone(),
            operation: self.operation.clone(),
            invalidates: self.invalidates.clone(),
            invalidates_with: self.invalidates_with.clone(),
            optimistic: self.optimistic.clone(),
            core: self.core.clone(),
        }
    }
}

impl<V, T> Mutation<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
{
    pub fn new<F, Fut>(cache: &QueryCache, operation: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let (state, _) = watch::channel(MutationState::default());
        Self {
            cache: cache.clone(),
            operation: Arc::new(move |variables| operation(variables).boxed()),
            invalidates: Vec::new(),
            invalidates_with: None,
            optimistic: Vec::new(),
            core: Arc::new(MutationCore { latest: AtomicU64::new(0), state }),
        }
    }

    /// Adapt a write following the remote `(data, error)` contract.
    pub fn from_remote<F, Fut>(cache: &QueryCache, call: F) -> Self
    where
        F: Fn(V) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RemoteResponse<T>, TransportError>> + Send + 'static,
    {
        Self::new(cache, move |variables| {
            let response = call(variables);
            async move { RemoteResponse::settle(response.await) }
        })
    }

    /// Keys to invalidate after every successful call.
    #[must_use]
    pub fn invalidates(mut self, keys: impl IntoIterator<Item = QueryKey>) -> Self {
        self.invalidates.extend(keys);
        self
    }

    /// Keys computed from the call's variables and result, in addition to
    /// the static ones.
    #[must_use]
    pub fn invalidates_with(mut self, keys: impl Fn(&V, &T) -> Vec<QueryKey> + Send + Sync + 'static) -> Self {
        self.invalidates_with = Some(Arc::new(keys));
        self
    }

    /// Write `update(current, variables)` into `key` while the call runs.
    ///
    /// Skipped when the key holds data of a type other than `D`.
    #[must_use]
    pub fn optimistic<D, F>(mut self, key: QueryKey, update: F) -> Self
    where
        D: Send + Sync + 'static,
        F: Fn(Option<&D>, &V) -> D + Send + Sync + 'static,
    {
        let apply: ApplyFn<V> = Arc::new(move |previous, variables| {
            let current = match previous {
                Some(any) => Some(any.downcast::<D>().ok()?),
                None => None,
            };
            Some(Arc::new(update(current.as_deref(), variables)) as AnyData)
        });
        self.optimistic.push(OptimisticUpdate { key, apply });
        self
    }

    #[must_use]
    pub fn state(&self) -> MutationState<T> {
        self.core.state.borrow().clone()
    }

    #[must_use]
    pub fn watch(&self) -> watch::Receiver<MutationState<T>> {
        self.core.state.subscribe()
    }

    /// Back to the idle state. Calls still running no longer update it.
    pub fn reset(&self) {
        self.core.latest.fetch_add(1, Ordering::AcqRel);
        self.core.state.send_replace(MutationState::default());
    }

    /// Run the write once. No retry.
    #[instrument(skip_all, fields(call))]
    pub async fn mutate(&self, variables: V) -> Result<Arc<T>, QueryError> {
        let call = self.core.latest.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::Span::current().record("call", call);
        self.core.update(call, |state| {
            state.is_pending = true;
            state.is_error = false;
            state.error = None;
        });
        let mut guard = PendingGuard {
            core: &self.core,
            cache: &self.cache,
            call,
            provisional: Vec::new(),
            armed: true,
        };
        let started = Instant::now();

        guard.provisional = self.apply_optimistic(&variables);
        let result = (self.operation)(variables.clone()).await;
        let elapsed = started.elapsed();
        let provisional = guard.disarm();

        match result {
            Ok(data) => {
                let data = Arc::new(data);
                let keys = self.keys_to_invalidate(&variables, &data, &provisional);
                let refetching = self.cache.invalidate(&keys);
                crate::metrics::record_mutation("success", elapsed);
                debug!(invalidated = keys.len(), refetching, "Mutation succeeded");
                self.core.update(call, |state| {
                    state.is_pending = false;
                    state.data = Some(data.clone());
                });
                Ok(data)
            }
            Err(err) => {
                rollback(&self.cache, provisional);
                crate::metrics::record_mutation("error", elapsed);
                crate::metrics::record_error("mutation", err.kind());
                warn!(error = %err, "Mutation failed");
                self.core.update(call, |state| {
                    state.is_pending = false;
                    state.is_error = true;
                    state.error = Some(err.clone());
                });
                Err(err)
            }
        }
    }

    /// [`mutate`](Self::mutate), then the matching callback. The result is
    /// still returned.
    pub async fn mutate_with(&self, variables: V, callbacks: MutateCallbacks<T>) -> Result<Arc<T>, QueryError> {
        let result = self.mutate(variables).await;
        match &result {
            Ok(data) => {
                if let Some(on_success) = callbacks.on_success {
                    on_success(data);
                }
            }
            Err(err) => {
                if let Some(on_error) = callbacks.on_error {
                    on_error(err);
                }
            }
        }
        result
    }

    fn apply_optimistic(&self, variables: &V) -> Vec<Provisional> {
        let mut provisional = Vec::with_capacity(self.optimistic.len());
        for update in &self.optimistic {
            let previous = self.cache.raw_data(&update.key);
            let Some(written) = (update.apply)(previous.clone(), variables) else {
                warn!(key = %update.key, "Optimistic update skipped: cached data has another type");
                continue;
            };
            if let Err(e) = self.cache.set_raw(&update.key, Some(written.clone())) {
                debug!(key = %update.key, error = %e, "Optimistic update not applied");
                continue;
            }
            provisional.push(Provisional { key: update.key.clone(), previous, written });
        }
        provisional
    }

    fn keys_to_invalidate(&self, variables: &V, data: &T, provisional: &[Provisional]) -> Vec<QueryKey> {
        let mut keys = self.invalidates.clone();
        if let Some(dynamic) = &self.invalidates_with {
            keys.extend(dynamic(variables, data));
        }
        keys.extend(provisional.iter().map(|p| p.key.clone()));
        let mut unique = Vec::with_capacity(keys.len());
        for key in keys {
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        unique
    }
}

impl<V, T> std::fmt::Debug for Mutation<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("invalidates", &self.invalidates)
            .field("optimistic", &self.optimistic.len())
            .finish()
    }
}
