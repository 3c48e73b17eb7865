//! Windowed reads over a collection cache.

use crate::index::InitialLoad;
use crate::types::{Entity, FromWireSnapshot};
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use super::collection::CollectionCache;
use super::listener::QueryCacheChildListener;

/// A [`CollectionCache`] with paging reads.
///
/// Listeners are not wired automatically; a boundary callback attaches
/// them as the consumer pages.
pub struct PagedCollectionCache<K, V> {
    cache: Arc<CollectionCache<K, V>>,
    clamp_threshold: usize,
}

impl<K, V> Deref for PagedCollectionCache<K, V> {
    type Target = CollectionCache<K, V>;

    fn deref(&self) -> &Self::Target {
        &self.cache
    }
}

impl<K, V> PagedCollectionCache<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity,
{
    pub fn new(cache: Arc<CollectionCache<K, V>>, clamp_threshold: usize) -> Arc<Self> {
        Arc::new(Self {
            cache,
            clamp_threshold,
        })
    }

    pub fn collection(&self) -> &Arc<CollectionCache<K, V>> {
        &self.cache
    }

    pub fn clamp_threshold(&self) -> usize {
        self.clamp_threshold
    }

    /// Initial window starting at `key`, or at the beginning when `key` is
    /// absent or within `clamp_threshold` of the start.
    pub fn load_initial(&self, key: Option<&K>, limit: usize, clamp_threshold: usize) -> InitialLoad<V> {
        let data = self.cache.index().load(key, limit, clamp_threshold);
        trace!(
            query = %self.cache.query(),
            items = data.items.len(),
            position = data.position,
            total = data.total_count,
            "Initial load"
        );
        data
    }

    /// Up to `limit` items strictly after `key`.
    pub fn load_after(&self, key: &K, limit: usize) -> Vec<V> {
        self.cache.index().range_from(key, false, limit)
    }

    /// Up to `limit` items strictly before `key`, in iteration order.
    pub fn load_before(&self, key: &K, limit: usize) -> Vec<V> {
        self.cache.index().range_to(key, false, limit)
    }

    /// Initial window at an iteration position.
    pub fn load_initial_at(&self, position: usize, count: usize) -> InitialLoad<V> {
        let total_count = self.cache.len();
        let position = position.min(total_count);
        InitialLoad {
            items: self.cache.index().range_at(position, count),
            position,
            total_count,
        }
    }

    /// `count` items starting at an iteration position.
    pub fn load_range(&self, start: usize, count: usize) -> Vec<V> {
        self.cache.index().range_at(start, count)
    }
}

impl<K, V> PagedCollectionCache<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity + FromWireSnapshot,
{
    /// A fresh counting child listener feeding this cache.
    pub fn child_listener(&self) -> Arc<QueryCacheChildListener<K, V>> {
        QueryCacheChildListener::new(self.cache.clone())
    }
}

// --- Item-keyed data source ---

/// Key a paging consumer uses to resume from an item.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DataSourceKey<K> {
    pub entity_id: String,
    pub key: K,
}

/// Item-keyed paging contract over a [`PagedCollectionCache`].
///
/// The first initial load registers for the next invalidate, after which
/// the source reports itself invalid and the consumer should create a new
/// one.
pub struct ItemKeyedDataSource<K, V> {
    cache: Arc<PagedCollectionCache<K, V>>,
    invalid: Arc<AtomicBool>,
    registered: AtomicBool,
}

impl<K, V> ItemKeyedDataSource<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity,
{
    pub fn new(cache: Arc<PagedCollectionCache<K, V>>) -> Self {
        Self {
            cache,
            invalid: Arc::new(AtomicBool::new(false)),
            registered: AtomicBool::new(false),
        }
    }

    pub fn load_initial(&self, requested: Option<&DataSourceKey<K>>, load_size: usize) -> InitialLoad<V> {
        let data = self.cache.load_initial(
            requested.map(|k| &k.key),
            load_size,
            self.cache.clamp_threshold(),
        );

        if !self.registered.swap(true, Ordering::SeqCst) {
            let invalid = self.invalid.clone();
            let query = self.cache.query().clone();
            self.cache.add_invalidation_listener(move || {
                debug!(query = %query, "Data source invalidated");
                invalid.store(true, Ordering::SeqCst);
            });
        }
        data
    }

    pub fn load_after(&self, key: &DataSourceKey<K>, load_size: usize) -> Vec<V> {
        self.cache.load_after(&key.key, load_size)
    }

    pub fn load_before(&self, key: &DataSourceKey<K>, load_size: usize) -> Vec<V> {
        self.cache.load_before(&key.key, load_size)
    }

    pub fn key_for(&self, item: &V) -> DataSourceKey<K> {
        DataSourceKey {
            entity_id: item.entity_id().to_string(),
            key: self.cache.key_of(item),
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::SeqCst)
    }

    /// Mark this source invalid without waiting for the cache.
    pub fn invalidate(&self) {
        self.invalid.store(true, Ordering::SeqCst);
    }
}
