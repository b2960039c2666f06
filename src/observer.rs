// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Query observer: binds one key and one read operation to a consumer's
//! lifetime.
//!
//! ```text
//!   new ──► mount ──► (subscribe, fetch if stale) ──► events ──► QueryState
//!             │                                                    │
//!             └── set_key / set_enabled / refetch          watch() receivers
//!   unmount / drop ──► unsubscribe, stop polling
//! ```
//!
//! The projection follows two rules:
//! - **stale-while-revalidate**: `is_loading` is only true while nothing has
//!   been fetched yet; a background refetch keeps showing the old data
//! - **stale-while-error**: a failed refetch sets `is_error` but keeps `data`
//!
//! Unmounting never aborts a fetch the cache already issued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, QueryCache, QueryFn, QueryStatus, Subscription, WeakQueryCache};
use crate::error::QueryError;
use crate::options::QueryOptions;
use crate::query_key::QueryKey;

/// What a consumer renders from.
#[derive(Debug)]
pub struct QueryState<T> {
    /// Last good data, kept across background refetches and errors
    pub data: Option<Arc<T>>,
    pub status: QueryStatus,
    pub error: Option<QueryError>,
    /// Fetching with nothing to show yet
    pub is_loading: bool,
    pub is_error: bool,
    /// Any fetch in flight, background refetches included
    pub is_fetching: bool,
}

impl<T> Clone for QueryState<T> {
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            status: self.status,
            error: self.error.clone(),
            is_loading: self.is_loading,
            is_error: self.is_error,
            is_fetching: self.is_fetching,
        }
    }
}

impl<T> Default for QueryState<T> {
    /// The disabled / never-fetched projection.
    fn default() -> Self {
        Self {
            data: None,
            status: QueryStatus::Idle,
            error: None,
            is_loading: false,
            is_error: false,
            is_fetching: false,
        }
    }
}

impl<T> QueryState<T> {
    #[must_use]
    pub fn from_entry(entry: &CacheEntry<T>) -> Self {
        Self {
            data: entry.data.clone(),
            status: entry.status,
            error: entry.error.clone(),
            is_loading: entry.status == QueryStatus::Loading && entry.data.is_none(),
            is_error: entry.status == QueryStatus::Error,
            is_fetching: entry.is_fetching,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }
}

/// State shared with the cache listener and the poller. Holds no strong
/// reference to the cache.
struct ObserverCore<T> {
    cache: WeakQueryCache,
    /// Bumped on every detach; listeners from older bindings stay silent.
    generation: AtomicU64,
    publish: Mutex<()>,
    state: watch::Sender<QueryState<T>>,
}

impl<T: Send + Sync + 'static> ObserverCore<T> {
    /// Re-project `key` into the watch channel, unless a newer binding took
    /// over.
    fn publish(&self, key: &QueryKey, generation: u64) {
        let _serialized = self.publish.lock();
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        let state = self
            .cache
            .upgrade()
            .and_then(|cache| cache.get::<T>(key))
            .map(|entry| QueryState::from_entry(&entry))
            .unwrap_or_default();
        self.state.send_replace(state);
    }

    fn publish_current(&self, key: &QueryKey) {
        self.publish(key, self.generation.load(Ordering::Acquire));
    }

    fn clear(&self) {
        let _serialized = self.publish.lock();
        self.state.send_replace(QueryState::default());
    }
}

struct Binding<T> {
    key: QueryKey,
    /// Operation as given, before any retry wrapping
    source: QueryFn<T>,
    /// Operation handed to the cache
    operation: QueryFn<T>,
    options: QueryOptions,
    mounted: bool,
    subscription: Option<Subscription>,
    poller: Option<JoinHandle<()>>,
}

impl<T: Send + 'static> Binding<T> {
    fn bind(&mut self, key: QueryKey, source: QueryFn<T>) {
        self.operation = wrap_operation(&key, &source, &self.options);
        self.key = key;
        self.source = source;
    }
}

fn wrap_operation<T: Send + 'static>(key: &QueryKey, source: &QueryFn<T>, options: &QueryOptions) -> QueryFn<T> {
    match &options.retry {
        Some(retry) => source.clone().with_retry(key.to_string(), retry.clone()),
        None => source.clone(),
    }
}

/// Reactive read of one key.
///
/// # Example
///
/// ```rust,no_run
/// use query_sync::{query_key, QueryCache, QueryCacheConfig, QueryFn, QueryObserver, QueryOptions};
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), query_sync::QueryError> {
/// let cache = QueryCache::create(QueryCacheConfig::default());
/// let observer = QueryObserver::new(
///     &cache,
///     query_key!["tasks", "u1"],
///     QueryFn::new(|| async { Ok(vec!["write report".to_string()]) }),
///     QueryOptions::default(),
/// );
///
/// let mut updates = observer.watch();
/// observer.mount()?;
/// updates.wait_for(|state| state.data.is_some()).await.ok();
/// assert_eq!(observer.state().data.map(|tasks| tasks.len()), Some(1));
/// # Ok(())
/// # }
/// ```
pub struct QueryObserver<T: Send + Sync + 'static> {
    cache: QueryCache,
    core: Arc<ObserverCore<T>>,
    binding: Mutex<Binding<T>>,
}

impl<T: Send + Sync + 'static> QueryObserver<T> {
    /// Create an unmounted observer. The initial state reflects whatever the
    /// cache already holds for `key`.
    pub fn new(cache: &QueryCache, key: QueryKey, operation: QueryFn<T>, options: QueryOptions) -> Self {
        let (state, _) = watch::channel(QueryState::default());
        let core = Arc::new(ObserverCore {
            cache: cache.downgrade(),
            generation: AtomicU64::new(0),
            publish: Mutex::new(()),
            state,
        });
        if options.enabled {
            core.publish_current(&key);
        }
        let binding = Binding {
            operation: wrap_operation(&key, &operation, &options),
            key,
            source: operation,
            options,
            mounted: false,
            subscription: None,
            poller: None,
        };
        Self {
            cache: cache.clone(),
            core,
            binding: Mutex::new(binding),
        }
    }

    /// Subscribe and fetch if the entry has no data, is invalidated, or is
    /// older than `stale_time`. A disabled observer only records that it is
    /// mounted. Calling `mount` twice is a no-op.
    pub fn mount(&self) -> Result<(), QueryError> {
        let mut binding = self.binding.lock();
        if binding.mounted {
            return Ok(());
        }
        if binding.options.enabled {
            if let Err(e) = self.attach(&mut binding) {
                Self::detach(&self.core, &mut binding);
                return Err(e);
            }
        }
        binding.mounted = true;
        debug!(key = %binding.key, enabled = binding.options.enabled, "Observer mounted");
        Ok(())
    }

    /// Stop reacting to the entry. An in-flight fetch still completes and
    /// lands in the cache.
    pub fn unmount(&self) {
        let mut binding = self.binding.lock();
        if !binding.mounted {
            return;
        }
        binding.mounted = false;
        Self::detach(&self.core, &mut binding);
        debug!(key = %binding.key, "Observer unmounted");
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.binding.lock().mounted
    }

    #[must_use]
    pub fn key(&self) -> QueryKey {
        self.binding.lock().key.clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions {
        self.binding.lock().options.clone()
    }

    /// Current projection.
    #[must_use]
    pub fn state(&self) -> QueryState<T> {
        self.core.state.borrow().clone()
    }

    /// Receiver that sees every projection change.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QueryState<T>> {
        self.core.state.subscribe()
    }

    /// Rebind to another key. The old subscription is torn down first, and
    /// nothing the old key emits afterwards reaches this observer.
    pub fn set_key(&self, key: QueryKey, operation: QueryFn<T>) -> Result<(), QueryError> {
        let mut binding = self.binding.lock();
        if binding.key == key {
            binding.bind(key, operation);
            return Ok(());
        }

        Self::detach(&self.core, &mut binding);
        debug!(from = %binding.key, to = %key, "Observer switching key");
        binding.bind(key, operation);

        if !binding.options.enabled {
            self.core.clear();
            return Ok(());
        }
        if binding.mounted {
            self.attach(&mut binding)
        } else {
            self.core.publish_current(&binding.key);
            Ok(())
        }
    }

    /// Enabling a mounted observer subscribes and fetches; disabling it
    /// unsubscribes and clears the projection.
    pub fn set_enabled(&self, enabled: bool) -> Result<(), QueryError> {
        let mut binding = self.binding.lock();
        if binding.options.enabled == enabled {
            return Ok(());
        }
        binding.options.enabled = enabled;
        debug!(key = %binding.key, enabled, "Observer toggled");

        if !enabled {
            Self::detach(&self.core, &mut binding);
            self.core.clear();
            return Ok(());
        }
        if binding.mounted {
            self.attach(&mut binding)
        } else {
            self.core.publish_current(&binding.key);
            Ok(())
        }
    }

    /// Replace the options of a live observer. Applies the new `enabled`
    /// flag, retry policy and polling period.
    pub fn set_options(&self, options: QueryOptions) -> Result<(), QueryError> {
        let enabled = options.enabled;
        {
            let mut binding = self.binding.lock();
            let reattach = binding.subscription.is_some()
                && (binding.options.refetch_interval != options.refetch_interval || binding.options.retry != options.retry);
            binding.options = QueryOptions { enabled: binding.options.enabled, ..options };
            let (key, source) = (binding.key.clone(), binding.source.clone());
            binding.bind(key, source);
            if reattach {
                Self::detach(&self.core, &mut binding);
                self.attach(&mut binding)?;
            }
        }
        self.set_enabled(enabled)
    }

    /// Fetch now, regardless of staleness. Still de-duplicated against any
    /// fetch in flight for the key.
    ///
    /// This is the one fetch a disabled observer performs: `enabled: false`
    /// suppresses automatic fetching (mount, key changes, polling), not an
    /// explicit call. The result lands in the cache and is returned, but a
    /// disabled observer's projection stays cleared.
    #[tracing::instrument(skip(self), fields(key = %self.key()))]
    pub async fn refetch(&self) -> Result<Arc<T>, QueryError> {
        let (key, operation, enabled) = {
            let binding = self.binding.lock();
            (binding.key.clone(), binding.operation.clone(), binding.options.enabled)
        };
        let result = self.cache.fetch(&key, operation).await;
        if enabled && self.key() == key {
            self.core.publish_current(&key);
        }
        result
    }

    fn attach(&self, binding: &mut Binding<T>) -> Result<(), QueryError> {
        let generation = self.core.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let key = binding.key.clone();

        let core = Arc::downgrade(&self.core);
        let listener_key = key.clone();
        let subscription = self.cache.subscribe(&key, move |_event| {
            if let Some(core) = core.upgrade() {
                core.publish(&listener_key, generation);
            }
        });
        if !subscription.is_active() {
            return Err(QueryError::Disposed);
        }
        binding.subscription = Some(subscription);

        let needs_fetch = match self.cache.get::<T>(&key) {
            Some(entry) => !entry.is_fetching && (entry.data.is_none() || entry.is_stale(binding.options.stale_time)),
            None => true,
        };
        self.core.publish(&key, generation);
        if needs_fetch {
            debug!(key = %key, "Observer fetching on attach");
            self.cache.prefetch(&key, binding.operation.clone())?;
        }

        if let Some(period) = binding.options.refetch_interval {
            binding.poller = self.spawn_poller(period, key, binding.operation.clone(), generation);
        }
        Ok(())
    }

    fn detach(core: &ObserverCore<T>, binding: &mut Binding<T>) {
        core.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(subscription) = binding.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(poller) = binding.poller.take() {
            poller.abort();
        }
    }

    fn spawn_poller(&self, period: Duration, key: QueryKey, operation: QueryFn<T>, generation: u64) -> Option<JoinHandle<()>> {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %key, "No Tokio runtime - refetch_interval ignored");
            return None;
        };
        let core: Weak<ObserverCore<T>> = Arc::downgrade(&self.core);
        let cache = self.cache.downgrade();

        Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let (Some(core), Some(cache)) = (core.upgrade(), cache.upgrade()) else { break };
                if core.generation.load(Ordering::Acquire) != generation {
                    break;
                }
                if let Err(e) = cache.prefetch(&key, operation.clone()) {
                    debug!(key = %key, error = %e, "Polling stopped");
                    break;
                }
            }
        }))
    }
}

impl<T: Send + Sync + 'static> Drop for QueryObserver<T> {
    fn drop(&mut self) {
        let binding = self.binding.get_mut();
        Self::detach(&self.core, binding);
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for QueryObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let binding = self.binding.lock();
        f.debug_struct("QueryObserver")
            .field("key", &binding.key)
            .field("mounted", &binding.mounted)
            .field("enabled", &binding.options.enabled)
            .finish()
    }
}
