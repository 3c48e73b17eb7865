//! Boundary callbacks that grow the remote window as a consumer pages.

use crate::error::Result;
use crate::lifecycle::Resource;
use crate::remote::ChildEventListener;
use crate::subscriptions::ListenerSet;
use crate::types::{Entity, FromWireSnapshot, QuerySpec};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

use super::listener::QueryCacheChildListener;
use super::paged::PagedCollectionCache;

type Listener<K, V> = Arc<QueryCacheChildListener<K, V>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    Initial,
    Front,
    End,
}

struct Slots<K, V> {
    initial: Option<Listener<K, V>>,
    front: Option<Listener<K, V>>,
    end: Option<Listener<K, V>>,
}

impl<K, V> Slots<K, V> {
    fn get_mut(&mut self, slot: Slot) -> &mut Option<Listener<K, V>> {
        match slot {
            Slot::Initial => &mut self.initial,
            Slot::Front => &mut self.front,
            Slot::End => &mut self.end,
        }
    }
}

/// Attaches bounded sub-queries at the edges of the loaded window.
///
/// Three slots (initial, front, end) each hold the last child listener
/// attached for that edge. A front or end listener is only attached once
/// the initial listener and the slot's previous listener have delivered a
/// full `limit` of children, so overlapping ranges are never requested
/// twice. Denied requests are logged and paging waits at the edge.
pub struct BoundaryCallback<K, V> {
    query: QuerySpec,
    cache: Arc<PagedCollectionCache<K, V>>,
    resource: Arc<Resource>,
    slots: Mutex<Slots<K, V>>,
}

impl<K, V> BoundaryCallback<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Serialize + Send + Sync + 'static,
    V: Entity + FromWireSnapshot,
{
    pub fn new(cache: Arc<PagedCollectionCache<K, V>>, resource: Arc<Resource>) -> Self {
        Self {
            query: cache.query().clone(),
            cache,
            resource,
            slots: Mutex::new(Slots {
                initial: None,
                front: None,
                end: None,
            }),
        }
    }

    /// Attach the initial listener on the base query.
    pub fn on_zero_items_loaded(&self) -> Result<bool> {
        let query = self.query.clone();
        self.attach(Slot::Initial, query)
    }

    /// Extend past the last loaded item.
    pub fn on_item_at_end_loaded(&self, item: &V) -> Result<bool> {
        if self.query.params.loads_all_data() {
            debug!(query = %self.query, "End load ignored, query loads all data");
            return Ok(false);
        }
        let key = self.cache.key_of(item);
        let sub_query = if self.query.params.is_view_from_left() {
            self.query.start_at_key(&key)?
        } else {
            self.query.end_at_key(&key)?
        };
        self.attach(Slot::End, sub_query)
    }

    /// Extend before the first loaded item.
    pub fn on_item_at_front_loaded(&self, item: &V) -> Result<bool> {
        if self.query.params.loads_all_data() {
            debug!(query = %self.query, "Front load ignored, query loads all data");
            return Ok(false);
        }
        if !self.query.params.has_start() {
            debug!(query = %self.query, "Front load ignored, no start bound");
            return Ok(false);
        }
        let key = self.cache.key_of(item);
        let sub_query = if self.query.params.is_view_from_left() {
            self.query.end_at_key(&key)?
        } else {
            self.query.start_at_key(&key)?
        };
        self.attach(Slot::Front, sub_query)
    }

    pub fn is_initial_complete(&self) -> bool {
        let slots = self.slots.lock();
        self.complete(&slots.initial)
    }

    pub fn can_add_front(&self) -> bool {
        let slots = self.slots.lock();
        self.can_add(&slots, Slot::Front)
    }

    pub fn can_add_end(&self) -> bool {
        let slots = self.slots.lock();
        self.can_add(&slots, Slot::End)
    }

    /// Listener currently held by the initial slot.
    pub fn initial_listener(&self) -> Option<Listener<K, V>> {
        self.slots.lock().initial.clone()
    }

    fn complete(&self, listener: &Option<Listener<K, V>>) -> bool {
        match listener {
            None => true,
            Some(l) => self
                .query
                .params
                .limit_count()
                .map_or(false, |limit| l.count() == limit as i64),
        }
    }

    fn can_add(&self, slots: &Slots<K, V>, slot: Slot) -> bool {
        let own = match slot {
            Slot::Initial => return self.complete(&slots.initial),
            Slot::Front => &slots.front,
            Slot::End => &slots.end,
        };
        self.complete(&slots.initial) && self.complete(own)
    }

    fn attach(&self, slot: Slot, sub_query: QuerySpec) -> Result<bool> {
        let listener = self.cache.child_listener();
        let previous = {
            let mut slots = self.slots.lock();
            if !self.can_add(&slots, slot) {
                debug!(query = %sub_query, slot = ?slot, "Denied boundary listener");
                return Ok(false);
            }
            slots.get_mut(slot).replace(listener.clone())
        };

        debug!(query = %sub_query, slot = ?slot, "Adding boundary listener");
        let erased: Arc<dyn ChildEventListener> = listener;
        if let Err(e) = self
            .resource
            .add_sub_query(&sub_query, ListenerSet::child(erased))
        {
            *self.slots.lock().get_mut(slot) = previous;
            return Err(e);
        }
        Ok(true)
    }
}

// --- Limit widening ---

/// Page sizes for [`LimitWideningCallback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PagingConfig {
    pub page_size: usize,
    pub initial_load_size_hint: usize,
}

impl Default for PagingConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            initial_load_size_hint: 60,
        }
    }
}

struct Widening<K, V> {
    active_query: Option<QuerySpec>,
    active_listener: Option<Listener<K, V>>,
    requested_limit: usize,
}

/// Grows one limited query instead of issuing a query per page.
///
/// Each step raises the limit (by the initial hint first, then by the page
/// size), subscribes the wider query and retires the previous listener.
/// The limit only grows once the cache holds everything already requested.
pub struct LimitWideningCallback<K, V> {
    base: QuerySpec,
    cache: Arc<PagedCollectionCache<K, V>>,
    resource: Arc<Resource>,
    config: PagingConfig,
    descending: bool,
    state: Mutex<Widening<K, V>>,
}

impl<K, V> LimitWideningCallback<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity + FromWireSnapshot,
{
    pub fn new(
        cache: Arc<PagedCollectionCache<K, V>>,
        resource: Arc<Resource>,
        config: PagingConfig,
        descending: bool,
    ) -> Self {
        Self {
            base: cache.query().unlimited(),
            cache,
            resource,
            config,
            descending,
            state: Mutex::new(Widening {
                active_query: None,
                active_listener: None,
                requested_limit: 0,
            }),
        }
    }

    pub fn requested_limit(&self) -> usize {
        self.state.lock().requested_limit
    }

    pub fn active_query(&self) -> Option<QuerySpec> {
        self.state.lock().active_query.clone()
    }

    /// Whether everything requested so far has arrived.
    pub fn can_widen(&self) -> bool {
        self.cache.len() >= self.state.lock().requested_limit
    }

    pub fn on_zero_items_loaded(&self) -> Result<bool> {
        if self.state.lock().active_query.is_some() {
            return Ok(false);
        }
        self.widen()
    }

    pub fn on_item_at_end_loaded(&self, _item: &V) -> Result<bool> {
        if !self.can_widen() {
            debug!(
                query = %self.base,
                cached = self.cache.len(),
                requested = self.requested_limit(),
                "Denied widening, previous window incomplete"
            );
            return Ok(false);
        }
        self.widen()
    }

    /// Widening only grows toward the end.
    pub fn on_item_at_front_loaded(&self, _item: &V) -> Result<bool> {
        Ok(false)
    }

    fn widen(&self) -> Result<bool> {
        let listener = self.cache.child_listener();
        let (query, previous) = {
            let mut state = self.state.lock();
            state.requested_limit += if state.active_query.is_none() {
                self.config.initial_load_size_hint
            } else {
                self.config.page_size
            };
            let query = if self.descending {
                self.base.clone().limit_to_last(state.requested_limit)
            } else {
                self.base.clone().limit_to_first(state.requested_limit)
            };
            let previous = state
                .active_listener
                .replace(listener.clone())
                .zip(state.active_query.replace(query.clone()));
            (query, previous)
        };

        debug!(query = %query, "Widening query");
        if let Some((ref old_listener, _)) = previous {
            old_listener.deactivate();
        }
        self.cache.index().clear();

        let erased: Arc<dyn ChildEventListener> = listener;
        self.resource
            .add_sub_query(&query, ListenerSet::child(erased))?;

        if let Some((old_listener, old_query)) = previous {
            let erased: Arc<dyn ChildEventListener> = old_listener;
            self.resource
                .remove_sub_query(&old_query, &ListenerSet::child(erased))?;
        }
        Ok(true)
    }
}
