//! Deduplicating table of caches.

use crate::context::CacheConfig;
use crate::error::{CacheError, Result};
use crate::index::SortKeyFn;
use crate::lifecycle::Scope;
use crate::scheduler::Scheduler;
use crate::types::{Entity, FromWireSnapshot, QuerySpec};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::collection::{CollectionCache, ItemInitializer};
use super::listener::QueryCacheChildListener;
use super::paged::PagedCollectionCache;
use super::value::ValueCache;

type AnyArc = Arc<dyn Any + Send + Sync>;

/// Type-erased cache held by the registry.
trait ManagedCache: Send + Sync {
    fn dispose(&self);
    fn into_any(self: Arc<Self>) -> AnyArc;
}

impl<K, V> ManagedCache for CollectionCache<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity,
{
    fn dispose(&self) {
        CollectionCache::dispose(self);
    }

    fn into_any(self: Arc<Self>) -> AnyArc {
        self
    }
}

impl<K, V> ManagedCache for PagedCollectionCache<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity,
{
    fn dispose(&self) {
        self.collection().dispose();
    }

    fn into_any(self: Arc<Self>) -> AnyArc {
        self
    }
}

/// Cache identity: the query plus the entity type.
type CacheKey = (QuerySpec, TypeId);

/// Shares caches among every request for the same query and entity type.
pub struct CacheRegistry {
    scope: Arc<Scope>,
    scheduler: Arc<dyn Scheduler>,
    config: CacheConfig,
    lists: RwLock<HashMap<CacheKey, Arc<dyn ManagedCache>>>,
    paged: RwLock<HashMap<CacheKey, Arc<dyn ManagedCache>>>,
    values: RwLock<HashMap<TypeId, AnyArc>>,
    initializers: RwLock<HashMap<TypeId, AnyArc>>,
}

impl CacheRegistry {
    pub fn new(scope: Arc<Scope>, scheduler: Arc<dyn Scheduler>, config: CacheConfig) -> Self {
        Self {
            scope,
            scheduler,
            config,
            lists: RwLock::new(HashMap::new()),
            paged: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            initializers: RwLock::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    /// Initializer applied to every `V` entering a cache created afterwards.
    pub fn set_initializer<V: 'static>(&self, initializer: ItemInitializer<V>) {
        self.initializers
            .write()
            .insert(TypeId::of::<V>(), Arc::new(initializer));
    }

    pub fn initializer<V: 'static>(&self) -> Option<ItemInitializer<V>> {
        self.initializers
            .read()
            .get(&TypeId::of::<V>())
            .and_then(|any| any.clone().downcast::<ItemInitializer<V>>().ok())
            .map(|init| (*init).clone())
    }

    /// Collection cache for a query, created and wired into the query's
    /// resource on first request.
    pub fn get_or_create<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: SortKeyFn<K, V>,
    ) -> Result<Arc<CollectionCache<K, V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        let key = (query.clone(), TypeId::of::<V>());
        if let Some(existing) = self.lists.read().get(&key) {
            return downcast(query, existing.clone());
        }

        let (cache, created) = {
            let mut lists = self.lists.write();
            match lists.get(&key) {
                Some(existing) => (downcast(query, existing.clone())?, false),
                None => {
                    let cache = self.build(query, sort_key);
                    lists.insert(key, cache.clone());
                    (cache, true)
                }
            }
        };

        if created {
            debug!(query = %query, "Created collection cache");
            let listener = QueryCacheChildListener::new(cache.clone());
            self.scope.resource(query).add_child_listener(listener)?;
        }
        Ok(cache)
    }

    /// Paged cache for a query. No listener is wired; paging attaches them.
    pub fn get_or_create_paged<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: SortKeyFn<K, V>,
    ) -> Result<Arc<PagedCollectionCache<K, V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        let key = (query.clone(), TypeId::of::<V>());
        if let Some(existing) = self.paged.read().get(&key) {
            return downcast(query, existing.clone());
        }

        let mut paged = self.paged.write();
        if let Some(existing) = paged.get(&key) {
            return downcast(query, existing.clone());
        }

        let cache = PagedCollectionCache::new(
            self.build(query, sort_key),
            self.config.initial_clamp_threshold,
        );
        paged.insert(key, cache.clone());
        debug!(query = %query, "Created paged cache");
        Ok(cache)
    }

    /// Single-value cache for an entity type.
    pub fn value_cache<V>(&self) -> Result<Arc<ValueCache<V>>>
    where
        V: FromWireSnapshot + Clone + Send + Sync + 'static,
    {
        let type_id = TypeId::of::<V>();
        if let Some(existing) = self.values.read().get(&type_id) {
            return downcast_value(existing.clone());
        }

        let mut values = self.values.write();
        let entry = values
            .entry(type_id)
            .or_insert_with(|| -> AnyArc {
                Arc::new(ValueCache::new(self.scope.clone(), self.initializer::<V>()))
            });
        downcast_value(entry.clone())
    }

    /// Evict and dispose the paged caches of a query.
    ///
    /// Returns the number of caches disposed.
    pub fn dispose(&self, query: &QuerySpec) -> usize {
        let evicted: Vec<Arc<dyn ManagedCache>> = {
            let mut paged = self.paged.write();
            let keys: Vec<CacheKey> = paged.keys().filter(|(q, _)| q == query).cloned().collect();
            keys.iter().filter_map(|k| paged.remove(k)).collect()
        };

        for cache in &evicted {
            cache.dispose();
        }
        if !evicted.is_empty() {
            debug!(query = %query, count = evicted.len(), "Disposed paged caches");
        }
        evicted.len()
    }

    /// Number of collection and paged caches held.
    pub fn cache_count(&self) -> usize {
        self.lists.read().len() + self.paged.read().len()
    }

    fn build<K, V>(&self, query: &QuerySpec, sort_key: SortKeyFn<K, V>) -> Arc<CollectionCache<K, V>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity,
    {
        CollectionCache::new(
            self.scope.handle(query),
            sort_key,
            self.scheduler.clone(),
            self.config.clone(),
            self.initializer::<V>(),
        )
    }
}

fn downcast<T: Send + Sync + 'static>(query: &QuerySpec, cache: Arc<dyn ManagedCache>) -> Result<Arc<T>> {
    cache
        .into_any()
        .downcast::<T>()
        .map_err(|_| CacheError::TypeMismatch {
            query: query.clone(),
        })
}

fn downcast_value<V: Send + Sync + 'static>(cache: AnyArc) -> Result<Arc<ValueCache<V>>> {
    cache
        .downcast::<ValueCache<V>>()
        .map_err(|_| CacheError::InvalidQuery("value cache registered with another type".to_string()))
}
