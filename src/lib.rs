//! # Query Sync
//!
//! A keyed query cache that sits between consumers and a remote relational
//! store: cached reads with loading / error / empty states, request
//! de-duplication, and mutations that invalidate the reads they affect.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Consumers (views)                       │
//! │  • QueryObserver: reactive {data, is_loading, is_error}     │
//! │  • Mutation: write + invalidate declared keys               │
//! │  • render(): error > loading > empty > populated            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                   subscribe / fetch / invalidate
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        QueryCache                           │
//! │  • DashMap of entries keyed by structural QueryKey          │
//! │  • One in-flight operation per key (shared future)          │
//! │  • Stale-while-revalidate, stale-while-error                │
//! │  • Background gc of inactive entries                        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                     QueryFn / Mutation operation
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  Remote Data Client                         │
//! │  • (data, error) contract, transport failures as Err        │
//! │  • RemoteStore trait, InMemoryRemote for tests              │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use query_sync::{
//!     query_key, Mutation, QueryCache, QueryCacheConfig, QueryFn, QueryObserver, QueryOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), query_sync::QueryError> {
//!     let cache = QueryCache::create(QueryCacheConfig::default());
//!     let key = query_key!["tasks", "u1"];
//!
//!     // A view binds a key to a read operation
//!     let tasks = QueryObserver::new(
//!         &cache,
//!         key.clone(),
//!         QueryFn::new(|| async { Ok(vec!["write report".to_string()]) }),
//!         QueryOptions::default(),
//!     );
//!     tasks.mount()?;
//!
//!     // A write invalidates the list; the mounted observer refetches on its own
//!     let add_task = Mutation::new(&cache, |title: String| async move { Ok(title) })
//!         .invalidates([key]);
//!     add_task.mutate("call GP".to_string()).await?;
//!
//!     cache.dispose();
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`cache`]: The [`QueryCache`], entries, subscriptions and fetch handles
//! - [`observer`]: [`QueryObserver`] and its [`QueryState`] projection
//! - [`mutation`]: [`Mutation`] with invalidation and optimistic updates
//! - [`render`]: The four-branch conditional render adapter
//! - [`remote`]: Remote Data Client contract and an in-memory store
//! - [`retry`]: Backoff policy for observers that opt in
//! - [`eviction`]: Retention policy for inactive entries

pub mod cache;
pub mod config;
pub mod error;
pub mod eviction;
pub mod metrics;
pub mod mutation;
pub mod observer;
pub mod options;
pub mod query_key;
pub mod remote;
pub mod render;
pub mod retry;

pub use cache::{
    CacheEntry, CacheEvent, CacheEventKind, CacheStats, QueryCache, QueryFn, QueryStatus, Subscription,
    WeakQueryCache,
};
pub use config::QueryCacheConfig;
pub use error::QueryError;
pub use mutation::{MutateCallbacks, Mutation, MutationState};
pub use observer::{QueryObserver, QueryState};
pub use options::QueryOptions;
pub use query_key::QueryKey;
pub use remote::{decode, Filter, InMemoryRemote, RemoteError, RemoteResponse, RemoteStore, TransportError};
pub use render::{render, select_branch, IsEmpty, RenderArms, RenderBranch};
pub use retry::RetryConfig;

#[doc(hidden)]
pub mod __private {
    pub use serde_json::json;
}
