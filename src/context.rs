//! Root context tying the cache components together.

use crate::cache::{
    BoundaryCallback, CacheRegistry, CollectionCache, ItemInitializer, ItemKeyedDataSource,
    LimitWideningCallback, PagedCollectionCache, PagingConfig,
};
use crate::error::Result;
use crate::lifecycle::{Resource, Scope};
use crate::observable::{Observable, Subscription, WeakObservable};
use crate::remote::RemoteSource;
use crate::scheduler::{Scheduler, ThreadScheduler};
use crate::subscriptions::SubscriptionManager;
use crate::types::{CacheScope, Entity, FromWireSnapshot, QuerySpec};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache configuration.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Coalescing window for list invalidation.
    /// Default: 250ms
    pub invalidate_debounce: Duration,

    /// Invalidate immediately once a limited query's cache reaches its limit.
    /// Default: false
    pub invalidate_at_limit: bool,

    /// How long a resource stays subscribed after its last consumer leaves.
    /// Default: 10s
    pub default_disconnect_delay: Duration,

    /// Initial loads keyed this close to the start begin at the start.
    /// Default: 10
    pub initial_clamp_threshold: usize,

    /// Ignore removes at anchored-limit boundaries.
    /// Default: true
    pub suppress_anchored_removes: bool,

    /// Dispose a query's paged caches when its resource deactivates.
    /// Default: false
    pub dispose_on_deactivate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            invalidate_debounce: Duration::from_millis(250),
            invalidate_at_limit: false,
            default_disconnect_delay: Duration::from_secs(10),
            initial_clamp_threshold: 10,
            suppress_anchored_removes: true,
            dispose_on_deactivate: false,
        }
    }
}

/// Explicitly constructed root of the cache: one remote source, one
/// scheduler, one scope and one registry.
///
/// Independent contexts share no state.
pub struct CacheContext {
    config: CacheConfig,
    scheduler: Arc<dyn Scheduler>,
    subscriptions: Arc<SubscriptionManager>,
    scope: Arc<Scope>,
    registry: Arc<CacheRegistry>,
}

impl CacheContext {
    /// Create a context.
    pub fn new(
        remote: Arc<dyn RemoteSource>,
        scheduler: Arc<dyn Scheduler>,
        config: CacheConfig,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(remote));
        let scope = Arc::new(Scope::new(
            subscriptions.clone(),
            scheduler.clone(),
            config.default_disconnect_delay,
        ));
        let registry = Arc::new(CacheRegistry::new(
            scope.clone(),
            scheduler.clone(),
            config.clone(),
        ));

        if config.dispose_on_deactivate {
            let weak = Arc::downgrade(&registry);
            scope.set_deactivate_hook(Arc::new(move |query: &QuerySpec| {
                if let Some(registry) = weak.upgrade() {
                    registry.dispose(query);
                }
            }));
        }

        debug!(scope = ?scope.id(), "Cache context created");

        Self {
            config,
            scheduler,
            subscriptions,
            scope,
            registry,
        }
    }

    /// Create a context with its own scheduler thread.
    pub fn with_thread_scheduler(remote: Arc<dyn RemoteSource>, config: CacheConfig) -> Result<Self> {
        let scheduler = Arc::new(ThreadScheduler::new()?);
        Ok(Self::new(remote, scheduler, config))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionManager> {
        &self.subscriptions
    }

    pub fn scope(&self) -> &Arc<Scope> {
        &self.scope
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }

    /// Register the initializer applied to entities of type `V`.
    pub fn set_initializer<V: 'static>(&self, initializer: ItemInitializer<V>) {
        self.registry.set_initializer(initializer);
    }

    /// Find the resource behind a handle an entity was loaded with.
    pub fn resolve(&self, handle: &CacheScope) -> Option<Arc<Resource>> {
        self.scope.resolve(handle)
    }

    // --- Views ---

    /// Shared collection cache for a query.
    pub fn collection<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: impl Fn(&V) -> K + Send + Sync + 'static,
    ) -> Result<Arc<CollectionCache<K, V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        self.registry.get_or_create(query, Arc::new(sort_key))
    }

    /// Live ordered list of a query.
    ///
    /// Observing the returned view keeps the query subscribed; after the
    /// last observer leaves it stays subscribed for `delay` (the configured
    /// default when `None`).
    pub fn list<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: impl Fn(&V) -> K + Send + Sync + 'static,
        delay: Option<Duration>,
    ) -> Result<Observable<Vec<V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        let cache = self.collection(query, sort_key)?;
        Ok(gated(cache.snapshots(), self.scope.resource(query), delay))
    }

    /// Live view of one entity of a query.
    pub fn item<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: impl Fn(&V) -> K + Send + Sync + 'static,
        entity_id: &str,
        delay: Option<Duration>,
    ) -> Result<Observable<Option<V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        let cache = self.collection(query, sort_key)?;
        Ok(gated(&cache.item(entity_id), self.scope.resource(query), delay))
    }

    /// Live single value of a query.
    pub fn value<V>(&self, query: &QuerySpec, delay: Option<Duration>) -> Result<Observable<Option<V>>>
    where
        V: FromWireSnapshot + Clone + Send + Sync + 'static,
    {
        let source = self.registry.value_cache::<V>()?.observable(query)?;
        Ok(gated(&source, self.scope.resource(query), delay))
    }

    // --- Paging ---

    /// Shared paged cache for a query.
    pub fn paged<K, V>(
        &self,
        query: &QuerySpec,
        sort_key: impl Fn(&V) -> K + Send + Sync + 'static,
    ) -> Result<Arc<PagedCollectionCache<K, V>>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        self.registry.get_or_create_paged(query, Arc::new(sort_key))
    }

    /// Live list of a paged cache, gated on its query's resource.
    pub fn paged_list<K, V>(
        &self,
        paged: &PagedCollectionCache<K, V>,
        delay: Option<Duration>,
    ) -> Observable<Vec<V>>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity,
    {
        gated(paged.snapshots(), self.scope.resource(paged.query()), delay)
    }

    pub fn data_source<K, V>(&self, paged: &Arc<PagedCollectionCache<K, V>>) -> ItemKeyedDataSource<K, V>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity,
    {
        ItemKeyedDataSource::new(paged.clone())
    }

    /// Boundary callback attaching bounded sub-queries at the window edges.
    pub fn boundary_callback<K, V>(&self, paged: &Arc<PagedCollectionCache<K, V>>) -> BoundaryCallback<K, V>
    where
        K: Ord + Clone + std::fmt::Debug + Serialize + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        BoundaryCallback::new(paged.clone(), self.scope.resource(paged.query()))
    }

    /// Boundary callback growing the limit of the paged query.
    pub fn limit_widening<K, V>(
        &self,
        paged: &Arc<PagedCollectionCache<K, V>>,
        paging: PagingConfig,
    ) -> LimitWideningCallback<K, V>
    where
        K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Entity + FromWireSnapshot,
    {
        let descending = !paged.query().params.is_view_from_left();
        LimitWideningCallback::new(
            paged.clone(),
            self.scope.resource(paged.query()),
            paging,
            descending,
        )
    }

    /// Evict and dispose the paged caches of a query.
    pub fn dispose(&self, query: &QuerySpec) -> usize {
        self.registry.dispose(query)
    }
}

/// A consumer-facing view of `source` whose observers hold `resource`
/// attached.
fn gated<T: Clone + Send + Sync + 'static>(
    source: &Observable<T>,
    resource: Arc<Resource>,
    delay: Option<Duration>,
) -> Observable<T> {
    let target: Arc<Mutex<Option<WeakObservable<T>>>> = Arc::new(Mutex::new(None));
    let forward: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let on_active = {
        let (source, target, forward, resource) =
            (source.clone(), target.clone(), forward.clone(), resource.clone());
        move || {
            resource.attach();
            let target = target.clone();
            let subscription = source.subscribe(move |delivery| {
                let view = target.lock().as_ref().and_then(|w| w.upgrade());
                if let Some(view) = view {
                    match delivery {
                        Ok(value) => view.post(value.clone()),
                        Err(error) => view.post_error(error.clone()),
                    }
                }
            });
            *forward.lock() = Some(subscription);
        }
    };

    let on_inactive = move || {
        let subscription = forward.lock().take();
        drop(subscription);
        if let Err(e) = resource.detach(delay) {
            warn!(query = %resource.query(), error = %e, "Detach failed");
        }
    };

    let view = Observable::with_hooks(on_active, on_inactive);
    *target.lock() = Some(view.downgrade());
    view
}
