//! Ordered collection cache for one query.

use crate::context::CacheConfig;
use crate::index::{OrderedIndex, SortKeyFn};
use crate::observable::Observable;
use crate::scheduler::{Scheduler, TimerHandle};
use crate::types::{CacheScope, Entity, QuerySpec, RemoteError, Scoped};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, trace, warn};

/// Injects scope metadata into an entity before it enters the cache.
pub type ItemInitializer<V> = Arc<dyn Fn(&mut V, &CacheScope) + Send + Sync>;

/// Initializer for entities that record their own scope.
pub fn scoped_initializer<V: Scoped + 'static>() -> ItemInitializer<V> {
    Arc::new(|item: &mut V, scope: &CacheScope| item.attach_scope(scope))
}

type InvalidationListener = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct Invalidation {
    pending: Option<TimerHandle>,
    /// Bumped whenever `pending` is replaced or cancelled.
    generation: u64,
    /// One-shot listeners, cleared after the next invalidate.
    listeners: Vec<InvalidationListener>,
}

/// Couples an [`OrderedIndex`] to the event stream of one query.
///
/// Mutations schedule a debounced invalidate which publishes the ordered
/// list to [`snapshots`](Self::snapshots). Per-item observables are created
/// lazily by [`item`](Self::item).
pub struct CollectionCache<K, V> {
    query: QuerySpec,
    scope: CacheScope,
    index: OrderedIndex<K, V>,
    items: RwLock<HashMap<String, Observable<Option<V>>>>,
    snapshots: Observable<Vec<V>>,
    invalidation: Mutex<Invalidation>,
    invalidations: AtomicU64,
    scheduler: Arc<dyn Scheduler>,
    config: CacheConfig,
    initializer: Option<ItemInitializer<V>>,
    self_ref: Weak<Self>,
}

impl<K, V> CollectionCache<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity,
{
    pub fn new(
        scope: CacheScope,
        sort_key: SortKeyFn<K, V>,
        scheduler: Arc<dyn Scheduler>,
        config: CacheConfig,
        initializer: Option<ItemInitializer<V>>,
    ) -> Arc<Self> {
        let query = scope.query.clone();
        let direction = query.params.direction();
        Arc::new_cyclic(|weak| Self {
            query,
            scope,
            index: OrderedIndex::new(direction, sort_key),
            items: RwLock::new(HashMap::new()),
            snapshots: Observable::new(),
            invalidation: Mutex::new(Invalidation::default()),
            invalidations: AtomicU64::new(0),
            scheduler,
            config,
            initializer,
            self_ref: weak.clone(),
        })
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    pub fn index(&self) -> &OrderedIndex<K, V> {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn key_of(&self, item: &V) -> K {
        self.index.key_of(item)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.index.get(key)
    }

    /// Current contents in iteration order.
    pub fn to_vec(&self) -> Vec<V> {
        self.index.to_vec()
    }

    /// Published list snapshots, one per invalidate.
    pub fn snapshots(&self) -> &Observable<Vec<V>> {
        &self.snapshots
    }

    /// Number of invalidates run so far.
    pub fn invalidation_count(&self) -> u64 {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Observable of one entity, created on first request.
    ///
    /// Holds `None` until the entity is cached and again after removal.
    pub fn item(&self, entity_id: &str) -> Observable<Option<V>> {
        if let Some(existing) = self.items.read().get(entity_id) {
            return existing.clone();
        }

        let mut items = self.items.write();
        items
            .entry(entity_id.to_string())
            .or_insert_with(|| {
                let observable = Observable::new();
                observable.post(self.index.get_by_id(entity_id));
                observable
            })
            .clone()
    }

    // --- Events ---

    pub fn on_child_added(&self, previous_sibling: Option<&str>, item: V) {
        let item = self.initialize(item);
        trace!(query = %self.query, entity_id = item.entity_id(), previous = ?previous_sibling, "Child added");
        self.index.insert(item.clone());
        self.post_item(item.entity_id(), Some(item.clone()));
        self.dispatch_invalidate();
    }

    pub fn on_child_changed(&self, previous_sibling: Option<&str>, item: V) {
        let item = self.initialize(item);
        trace!(query = %self.query, entity_id = item.entity_id(), previous = ?previous_sibling, "Child changed");
        if self.index.update_before_key(previous_sibling, item.clone()) {
            self.post_item(item.entity_id(), Some(item.clone()));
            self.dispatch_invalidate();
        }
    }

    pub fn on_child_removed(&self, item: V) {
        let item = self.initialize(item);
        if self.config.suppress_anchored_removes && self.should_ignore_remove(&item) {
            trace!(query = %self.query, entity_id = item.entity_id(), "Remove suppressed at limit boundary");
            return;
        }

        let removed = self.index.remove_by_computed_key(&item);
        self.post_item(item.entity_id(), None);
        if removed {
            self.dispatch_invalidate();
        } else {
            trace!(query = %self.query, entity_id = item.entity_id(), "Remove of absent child ignored");
        }
    }

    /// Moves arrive paired with a changed event, which repositions the
    /// entity; nothing happens here.
    pub fn on_child_moved(&self, previous_sibling: Option<&str>, item: &V) {
        trace!(query = %self.query, entity_id = item.entity_id(), previous = ?previous_sibling, "Child moved");
    }

    /// Publish a remote error in place of the next list.
    pub fn on_cancelled(&self, error: &RemoteError) {
        warn!(query = %self.query, error = %error, "Remote subscription cancelled");
        self.snapshots.post_error(error.clone());
    }

    /// Insert many entities with one invalidate.
    pub fn insert_all(&self, items: Vec<V>) {
        let items: Vec<V> = items.into_iter().map(|i| self.initialize(i)).collect();
        self.index.insert_all(items.iter().cloned());
        for item in items {
            self.post_item(item.entity_id(), Some(item.clone()));
        }
        self.dispatch_invalidate();
    }

    /// Whether a remove should be ignored because the remote will replace
    /// the entity with the one sliding into the limited window.
    ///
    /// With an anchored limit, ignores removes at 1-based positions that are
    /// a multiple of the limit, and the last position once the cache holds
    /// more than the limit. An absent entity counts as position 0.
    pub fn should_ignore_remove(&self, item: &V) -> bool {
        if !self.query.params.has_anchored_limit() {
            return false;
        }
        let limit = match self.query.params.limit_count() {
            Some(limit) if limit > 0 => limit,
            _ => return false,
        };
        let pos = self.index.position_of(item).map_or(0, |p| p + 1);
        pos % limit == 0 || (pos == self.index.len() && pos > limit)
    }

    // --- Invalidation ---

    /// Register a listener for the next invalidate only.
    pub fn add_invalidation_listener(&self, listener: impl FnOnce() + Send + 'static) {
        self.invalidation.lock().listeners.push(Box::new(listener));
    }

    /// Schedule a coalesced invalidate.
    ///
    /// Each call restarts the debounce window. With `invalidate_at_limit`,
    /// reaching the query limit invalidates immediately instead.
    pub fn dispatch_invalidate(&self) {
        if self.config.invalidate_at_limit {
            if let Some(limit) = self.query.params.limit_count() {
                if self.index.len() >= limit {
                    debug!(query = %self.query, limit, "Limit reached, invalidating immediately");
                    self.cancel_pending();
                    self.invalidate();
                    return;
                }
            }
        }

        let mut state = self.invalidation.lock();
        if let Some(pending) = state.pending.take() {
            pending.cancel();
        }
        state.generation += 1;
        let generation = state.generation;
        let weak = self.self_ref.clone();
        state.pending = Some(self.scheduler.schedule(
            self.config.invalidate_debounce,
            Box::new(move || {
                if let Some(cache) = weak.upgrade() {
                    cache.fire_debounced(generation);
                }
            }),
        ));
    }

    /// Run a debounced invalidate unless a later dispatch superseded it
    /// after the scheduler had already committed to running it.
    fn fire_debounced(&self, generation: u64) {
        {
            let mut state = self.invalidation.lock();
            if state.generation != generation {
                trace!(query = %self.query, "Superseded invalidate skipped");
                return;
            }
            state.pending = None;
        }
        self.invalidate();
    }

    fn cancel_pending(&self) {
        let mut state = self.invalidation.lock();
        if let Some(pending) = state.pending.take() {
            pending.cancel();
            state.generation += 1;
        }
    }

    /// Number of one-shot listeners waiting for the next invalidate.
    pub fn invalidation_listener_count(&self) -> usize {
        self.invalidation.lock().listeners.len()
    }

    pub fn has_pending_invalidate(&self) -> bool {
        self.invalidation.lock().pending.is_some()
    }

    /// Publish the current list and fire one-shot invalidation listeners.
    pub fn invalidate(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        let listeners = std::mem::take(&mut self.invalidation.lock().listeners);
        let items = self.index.to_vec();
        trace!(query = %self.query, count = items.len(), listeners = listeners.len(), "Invalidate");

        self.snapshots.post(items);
        for listener in listeners {
            listener();
        }
    }

    /// Clear the index and publish the empty list.
    pub fn dispose(&self) {
        self.cancel_pending();
        debug!(query = %self.query, count = self.index.len(), "Disposing collection cache");
        self.index.clear();
        self.invalidate();
    }

    fn initialize(&self, mut item: V) -> V {
        if let Some(ref init) = self.initializer {
            init(&mut item, &self.scope);
        }
        item
    }

    fn post_item(&self, entity_id: &str, value: Option<V>) {
        let observable = self.items.read().get(entity_id).cloned();
        if let Some(observable) = observable {
            observable.post(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ManualScheduler;
    use crate::types::ScopeId;
    use std::time::Duration;

    #[derive(Clone, Debug, PartialEq)]
    struct Post {
        id: String,
        score: i64,
        scope: Option<CacheScope>,
    }

    impl Entity for Post {
        fn entity_id(&self) -> &str {
            &self.id
        }
    }

    impl Scoped for Post {
        fn attach_scope(&mut self, scope: &CacheScope) {
            self.scope = Some(scope.clone());
        }
    }

    fn post(id: &str, score: i64) -> Post {
        Post {
            id: id.to_string(),
            score,
            scope: None,
        }
    }

    fn cache(query: QuerySpec) -> (Arc<ManualScheduler>, Arc<CollectionCache<i64, Post>>) {
        let scheduler = Arc::new(ManualScheduler::new());
        let cache = CollectionCache::new(
            CacheScope {
                scope: ScopeId(1),
                query,
            },
            Arc::new(|p: &Post| p.score),
            scheduler.clone(),
            CacheConfig::default(),
            Some(scoped_initializer()),
        );
        (scheduler, cache)
    }

    #[test]
    fn test_mutations_coalesce_into_one_invalidate() {
        let (scheduler, cache) = cache(QuerySpec::new("posts"));

        for i in 0..5 {
            cache.on_child_added(None, post(&i.to_string(), i));
            scheduler.advance(Duration::from_millis(50));
        }
        assert_eq!(cache.invalidation_count(), 0);

        scheduler.advance(Duration::from_millis(250));
        assert_eq!(cache.invalidation_count(), 1);
        assert_eq!(cache.snapshots().current().unwrap().unwrap().len(), 5);
    }

    #[test]
    fn test_spaced_mutations_invalidate_each() {
        let (scheduler, cache) = cache(QuerySpec::new("posts"));

        for i in 0..3 {
            cache.on_child_added(None, post(&i.to_string(), i));
            scheduler.advance(Duration::from_millis(300));
        }
        assert_eq!(cache.invalidation_count(), 3);
    }

    #[test]
    fn test_items_receive_scope() {
        let (_scheduler, cache) = cache(QuerySpec::new("posts"));
        cache.on_child_added(None, post("a", 1));

        let stored = cache.get(&1).unwrap();
        assert_eq!(stored.scope.map(|s| s.query), Some(QuerySpec::new("posts")));
    }

    #[test]
    fn test_item_observable_follows_entity() {
        let (_scheduler, cache) = cache(QuerySpec::new("posts"));
        let item = cache.item("a");
        assert_eq!(item.current(), Some(Ok(None)));

        cache.on_child_added(None, post("a", 1));
        assert_eq!(item.current().unwrap().unwrap().map(|p| p.score), Some(1));

        cache.on_child_removed(post("a", 1));
        assert_eq!(item.current(), Some(Ok(None)));
    }

    #[test]
    fn test_duplicate_remove_is_noop() {
        let (scheduler, cache) = cache(QuerySpec::new("posts"));
        cache.on_child_added(None, post("a", 1));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(cache.invalidation_count(), 1);

        cache.on_child_removed(post("a", 1));
        scheduler.advance(Duration::from_secs(1));
        cache.on_child_removed(post("a", 1));
        scheduler.advance(Duration::from_secs(1));

        assert_eq!(cache.invalidation_count(), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_remove_suppressed_at_limit_multiple() {
        let (_scheduler, cache) = cache(QuerySpec::new("posts").limit_to_first(10));
        for i in 1..=10 {
            cache.on_child_added(None, post(&i.to_string(), i));
        }

        cache.on_child_removed(post("10", 10));
        assert_eq!(cache.len(), 10);

        cache.on_child_removed(post("5", 5));
        assert_eq!(cache.len(), 9);
    }

    #[test]
    fn test_invalidate_at_limit_short_circuits() {
        let scheduler = Arc::new(ManualScheduler::new());
        let config = CacheConfig {
            invalidate_at_limit: true,
            ..Default::default()
        };
        let cache: Arc<CollectionCache<i64, Post>> = CollectionCache::new(
            CacheScope {
                scope: ScopeId(1),
                query: QuerySpec::new("posts").limit_to_first(2),
            },
            Arc::new(|p: &Post| p.score),
            scheduler.clone(),
            config,
            None,
        );

        cache.on_child_added(None, post("a", 1));
        assert_eq!(cache.invalidation_count(), 0);
        cache.on_child_added(Some("a"), post("b", 2));
        assert_eq!(cache.invalidation_count(), 1);

        scheduler.advance(Duration::from_secs(1));
        assert_eq!(cache.invalidation_count(), 1);
    }

    #[test]
    fn test_invalidation_listeners_are_one_shot() {
        let (scheduler, cache) = cache(QuerySpec::new("posts"));
        let fired = Arc::new(AtomicU64::new(0));
        let counter = fired.clone();
        cache.add_invalidation_listener(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        cache.on_child_added(None, post("a", 1));
        scheduler.advance(Duration::from_secs(1));
        cache.on_child_added(None, post("b", 2));
        scheduler.advance(Duration::from_secs(1));

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    /// Hands tasks back to the test instead of running them.
    #[derive(Default)]
    struct HeldScheduler {
        tasks: Mutex<Vec<(crate::scheduler::Task, TimerHandle)>>,
    }

    impl Scheduler for HeldScheduler {
        fn schedule(&self, _delay: Duration, task: crate::scheduler::Task) -> TimerHandle {
            let handle = TimerHandle::default();
            self.tasks.lock().push((task, handle.clone()));
            handle
        }
    }

    #[test]
    fn test_stale_debounce_task_keeps_newer_pending() {
        let scheduler = Arc::new(HeldScheduler::default());
        let cache: Arc<CollectionCache<i64, Post>> = CollectionCache::new(
            CacheScope {
                scope: ScopeId(1),
                query: QuerySpec::new("posts"),
            },
            Arc::new(|p: &Post| p.score),
            scheduler.clone(),
            CacheConfig::default(),
            None,
        );

        cache.on_child_added(None, post("a", 1));
        let (first, _) = scheduler.tasks.lock().remove(0);

        // A worker that already passed the cancel check still runs the task
        cache.on_child_added(None, post("b", 2));
        first();
        assert_eq!(cache.invalidation_count(), 0);
        assert!(cache.has_pending_invalidate());

        cache.on_child_added(None, post("c", 3));
        let tasks = scheduler.tasks.lock();
        assert_eq!(tasks.len(), 2);
        assert!(tasks[0].1.is_cancelled());
        assert!(!tasks[1].1.is_cancelled());
    }

    #[test]
    fn test_cancelled_posts_error() {
        let (_scheduler, cache) = cache(QuerySpec::new("posts"));
        cache.on_cancelled(&RemoteError::permission_denied("nope"));

        assert!(matches!(cache.snapshots().current(), Some(Err(_))));
    }

    #[test]
    fn test_dispose_publishes_empty_list() {
        let (scheduler, cache) = cache(QuerySpec::new("posts"));
        cache.on_child_added(None, post("a", 1));
        cache.dispose();

        assert_eq!(cache.snapshots().current(), Some(Ok(vec![])));
        scheduler.advance(Duration::from_secs(1));
        assert_eq!(cache.invalidation_count(), 1);
    }
}
