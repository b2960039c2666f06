use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::WeakQueryCache;
use crate::query_key::QueryKey;

/// Handle returned by [`QueryCache::subscribe`](super::QueryCache::subscribe).
///
/// Unsubscribes on [`unsubscribe`](Self::unsubscribe) or drop, whichever
/// comes first. Further calls are no-ops.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    cache: WeakQueryCache,
    key: QueryKey,
    id: u64,
    active: Arc<AtomicBool>,
}

impl Subscription {
    pub(crate) fn new(cache: WeakQueryCache, key: QueryKey, id: u64, active: Arc<AtomicBool>) -> Self {
        Self { cache, key, id, active }
    }

    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(cache) = self.cache.upgrade() {
            cache.remove_listener(&self.key, self.id);
        }
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
