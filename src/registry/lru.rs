use crate::core::StageHandle;
use lru::LruCache;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::Instant;

/// Recency order over resident stages.
///
/// Kept apart from the entries themselves so that promoting a stage on access
/// never waits for its content lock.
pub(crate) struct LruTracker {
    order: Mutex<LruCache<StageHandle, Instant>>,
}

impl LruTracker {
    pub fn new() -> Self {
        Self {
            order: Mutex::new(LruCache::unbounded()),
        }
    }

    fn order(&self) -> MutexGuard<'_, LruCache<StageHandle, Instant>> {
        // Every critical section is a single LruCache call, so a poisoned
        // lock still guards consistent data.
        self.order.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, handle: StageHandle) {
        self.order().put(handle, Instant::now());
    }

    /// Promotes `handle` to most recently used. Unknown handles are ignored so
    /// a late touch cannot resurrect a stage that was just removed.
    pub fn touch(&self, handle: StageHandle) {
        if let Some(last_access) = self.order().get_mut(&handle) {
            *last_access = Instant::now();
        }
    }

    pub fn remove(&self, handle: StageHandle) {
        self.order().pop(&handle);
    }

    pub fn last_access(&self, handle: StageHandle) -> Option<Instant> {
        self.order().peek(&handle).copied()
    }

    /// Handles ordered from least to most recently used.
    pub fn least_recent_first(&self) -> Vec<(StageHandle, Instant)> {
        self.order()
            .iter()
            .rev()
            .map(|(handle, at)| (*handle, *at))
            .collect()
    }
}
