//! Adapters from remote events to cache mutations.

use crate::remote::ChildEventListener;
use crate::types::{Entity, FromWireSnapshot, RemoteError, Snapshot};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::warn;

use super::collection::CollectionCache;

/// Decodes child events and applies them to a [`CollectionCache`].
///
/// Counts delivered children (added +1, removed -1) so paging can tell when
/// a limited query has delivered its full window. A deactivated listener
/// ignores every event.
pub struct QueryCacheChildListener<K, V> {
    cache: Arc<CollectionCache<K, V>>,
    count: AtomicI64,
    active: AtomicBool,
}

impl<K, V> QueryCacheChildListener<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity + FromWireSnapshot,
{
    pub fn new(cache: Arc<CollectionCache<K, V>>) -> Arc<Self> {
        Arc::new(Self {
            cache,
            count: AtomicI64::new(0),
            active: AtomicBool::new(true),
        })
    }

    /// Net number of children delivered.
    pub fn count(&self) -> i64 {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop applying events.
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    fn decode(&self, snapshot: &Snapshot) -> Option<V> {
        if !self.is_active() {
            return None;
        }
        match V::from_snapshot(snapshot) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(
                    query = %self.cache.query(),
                    key = %snapshot.key,
                    error = %e,
                    "Skipping undecodable snapshot"
                );
                None
            }
        }
    }
}

impl<K, V> ChildEventListener for QueryCacheChildListener<K, V>
where
    K: Ord + Clone + std::fmt::Debug + Send + Sync + 'static,
    V: Entity + FromWireSnapshot,
{
    fn on_child_added(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        if let Some(item) = self.decode(snapshot) {
            self.cache.on_child_added(previous_sibling, item);
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_child_changed(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        if let Some(item) = self.decode(snapshot) {
            self.cache.on_child_changed(previous_sibling, item);
        }
    }

    fn on_child_removed(&self, snapshot: &Snapshot) {
        if let Some(item) = self.decode(snapshot) {
            self.cache.on_child_removed(item);
            self.count.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn on_child_moved(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        if let Some(item) = self.decode(snapshot) {
            self.cache.on_child_moved(previous_sibling, &item);
        }
    }

    fn on_cancelled(&self, error: &RemoteError) {
        if self.is_active() {
            self.cache.on_cancelled(error);
        }
    }
}
