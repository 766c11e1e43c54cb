//! Aggregate caches.
//!
//! A runtime keeps one cache per tenant so that consecutive passes over a hot
//! aggregate skip the database read. Caches are ephemeral and never shared
//! between runtimes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;

/// Recently-used aggregates of one tenant, keyed by identity.
pub trait AggregateCache<Id, D>: Send + Sync {
    /// Cached aggregate for `id`, marking it as recently used.
    fn try_find(&self, id: &Id) -> Option<D>;

    /// Cache `aggregate` under `id`.
    fn store(&self, id: Id, aggregate: D);

    /// Evict `id`.
    fn remove(&self, id: &Id);

    /// Trim the cache back to its limit, evicting least recently used
    /// entries first.
    fn compact_if_necessary(&self);

    /// Number of cached aggregates.
    fn len(&self) -> usize;

    /// Whether nothing is cached.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cache that stores nothing. Used when caching is disabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct NulloAggregateCache;

impl<Id, D> AggregateCache<Id, D> for NulloAggregateCache {
    fn try_find(&self, _id: &Id) -> Option<D> {
        None
    }

    fn store(&self, _id: Id, _aggregate: D) {}

    fn remove(&self, _id: &Id) {}

    fn compact_if_necessary(&self) {}

    fn len(&self) -> usize {
        0
    }
}

struct Entry<D> {
    aggregate: D,
    last_used: u64,
}

struct RecentlyUsedState<Id, D> {
    entries: HashMap<Id, Entry<D>>,
    clock: u64,
}

impl<Id, D> RecentlyUsedState<Id, D> {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// Bounded cache evicting least recently used aggregates on compaction.
///
/// The cache may exceed its limit between compactions; the runtime compacts
/// once per pass, after all misses have been fetched.
///
/// # Examples
///
/// ```
/// use foldline_projections::cache::{AggregateCache, RecentlyUsedCache};
///
/// let cache = RecentlyUsedCache::new(2);
/// cache.store("a", 1);
/// cache.store("b", 2);
/// cache.store("c", 3);
/// assert_eq!(cache.try_find(&"a"), Some(1));
///
/// cache.compact_if_necessary();
/// assert_eq!(cache.len(), 2);
/// assert_eq!(cache.try_find(&"b"), None);
/// ```
pub struct RecentlyUsedCache<Id, D> {
    limit: usize,
    state: Mutex<RecentlyUsedState<Id, D>>,
}

impl<Id, D> RecentlyUsedCache<Id, D> {
    /// Create a cache holding at most `limit` aggregates after compaction.
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            state: Mutex::new(RecentlyUsedState {
                entries: HashMap::new(),
                clock: 0,
            }),
        }
    }

    /// Configured limit.
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.limit
    }

    fn state(&self) -> std::sync::MutexGuard<'_, RecentlyUsedState<Id, D>> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl<Id, D> AggregateCache<Id, D> for RecentlyUsedCache<Id, D>
where
    Id: Eq + Hash + Clone + Send,
    D: Clone + Send,
{
    fn try_find(&self, id: &Id) -> Option<D> {
        let mut state = self.state();
        let stamp = state.tick();
        state.entries.get_mut(id).map(|entry| {
            entry.last_used = stamp;
            entry.aggregate.clone()
        })
    }

    fn store(&self, id: Id, aggregate: D) {
        let mut state = self.state();
        let last_used = state.tick();
        state.entries.insert(
            id,
            Entry {
                aggregate,
                last_used,
            },
        );
    }

    fn remove(&self, id: &Id) {
        self.state().entries.remove(id);
    }

    fn compact_if_necessary(&self) {
        let mut state = self.state();
        let excess = state.entries.len().saturating_sub(self.limit);
        if excess == 0 {
            return;
        }

        let mut by_age: Vec<(u64, Id)> = state
            .entries
            .iter()
            .map(|(id, entry)| (entry.last_used, id.clone()))
            .collect();
        by_age.sort_unstable_by_key(|(last_used, _)| *last_used);
        for (_, id) in by_age.into_iter().take(excess) {
            state.entries.remove(&id);
        }
        tracing::debug!(evicted = excess, limit = self.limit, "Compacted aggregate cache");
    }

    fn len(&self) -> usize {
        self.state().entries.len()
    }
}
