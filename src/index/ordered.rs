//! Sorted map from derived sort key to entity.

use crate::types::{Direction, Entity};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound::{Excluded, Included, Unbounded};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Computes the sort key of an entity.
pub type SortKeyFn<K, V> = Arc<dyn Fn(&V) -> K + Send + Sync>;

/// Result of an initial window read.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialLoad<V> {
    /// Items in iteration order.
    pub items: Vec<V>,
    /// Number of items preceding the first returned item.
    pub position: usize,
    /// Total number of items in the index.
    pub total_count: usize,
}

/// Thread-safe ordered index.
///
/// At most one entry exists per sort key; a later insert with an equal key
/// replaces the earlier entity.
pub struct OrderedIndex<K, V> {
    /// Entries in natural key order.
    entries: RwLock<BTreeMap<K, V>>,

    /// Iteration order exposed to readers.
    direction: Direction,

    /// Derives the sort key of an entity.
    sort_key: SortKeyFn<K, V>,
}

impl<K, V> OrderedIndex<K, V>
where
    K: Ord + Clone + std::fmt::Debug,
    V: Entity,
{
    /// Create an empty index.
    pub fn new(direction: Direction, sort_key: SortKeyFn<K, V>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            direction,
            sort_key,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Compute the sort key of an entity.
    pub fn key_of(&self, value: &V) -> K {
        (self.sort_key)(value)
    }

    // --- Mutation ---

    /// Upsert at the entity's computed key.
    pub fn insert(&self, value: V) {
        let key = self.key_of(&value);
        trace!(key = ?key, entity_id = value.entity_id(), "Index insert");
        self.entries.write().insert(key, value);
    }

    /// Insert many entities under one lock.
    pub fn insert_all(&self, values: impl IntoIterator<Item = V>) {
        let mut entries = self.entries.write();
        for value in values {
            entries.insert(self.key_of(&value), value);
        }
    }

    /// Remove the entry at the entity's computed key.
    ///
    /// Returns whether anything was removed.
    pub fn remove_by_computed_key(&self, value: &V) -> bool {
        let key = self.key_of(value);
        self.entries.write().remove(&key).is_some()
    }

    /// Apply a change reported relative to the previous sibling.
    ///
    /// Sibling ids follow the remote's natural ascending order regardless of
    /// this index's iteration direction. With no sibling, the entity is first
    /// in that order and the smallest entry is replaced. Otherwise the entry
    /// immediately after the sibling is replaced.
    ///
    /// When the sibling is the last entry there is nothing to replace; the
    /// entity is inserted without removing anything, which can leave a stale
    /// revision behind. On an empty index with no sibling nothing happens.
    ///
    /// Returns whether the entity was written.
    pub fn update_before_key(&self, previous_sibling: Option<&str>, value: V) -> bool {
        let new_key = self.key_of(&value);
        let mut entries = self.entries.write();

        match previous_sibling {
            None => {
                let first = match entries.keys().next() {
                    Some(k) => k.clone(),
                    None => {
                        warn!(
                            entity_id = value.entity_id(),
                            "Update at head of an empty index, ignoring"
                        );
                        return false;
                    }
                };
                entries.remove(&first);
            }
            Some(sibling_id) => {
                let sibling_key = entries
                    .iter()
                    .find(|(_, v)| v.entity_id() == sibling_id)
                    .map(|(k, _)| k.clone());

                match sibling_key {
                    None => {
                        warn!(
                            sibling = sibling_id,
                            entity_id = value.entity_id(),
                            "Previous sibling not in index, inserting"
                        );
                    }
                    Some(sibling_key) => {
                        let next = entries
                            .range((Excluded(&sibling_key), Unbounded))
                            .next()
                            .map(|(k, _)| k.clone());
                        match next {
                            Some(next) => {
                                entries.remove(&next);
                            }
                            None => {
                                error!(
                                    sibling = sibling_id,
                                    entity_id = value.entity_id(),
                                    "No entry after previous sibling, inserting without removal"
                                );
                            }
                        }
                    }
                }
            }
        }

        entries.insert(new_key, value);
        true
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    // --- Reads ---

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Find an entity by its id (linear scan).
    pub fn get_by_id(&self, entity_id: &str) -> Option<V> {
        self.entries
            .read()
            .values()
            .find(|v| v.entity_id() == entity_id)
            .cloned()
    }

    /// All entities in iteration order.
    pub fn to_vec(&self) -> Vec<V> {
        let entries = self.entries.read();
        match self.direction {
            Direction::Ascending => entries.values().cloned().collect(),
            Direction::Descending => entries.values().rev().cloned().collect(),
        }
    }

    /// First entity in iteration order.
    pub fn first(&self) -> Option<V> {
        let entries = self.entries.read();
        match self.direction {
            Direction::Ascending => entries.values().next().cloned(),
            Direction::Descending => entries.values().next_back().cloned(),
        }
    }

    /// Last entity in iteration order.
    pub fn last(&self) -> Option<V> {
        let entries = self.entries.read();
        match self.direction {
            Direction::Ascending => entries.values().next_back().cloned(),
            Direction::Descending => entries.values().next().cloned(),
        }
    }

    /// Up to `limit` items starting at `key`, in iteration order.
    pub fn range_from(&self, key: &K, inclusive: bool, limit: usize) -> Vec<V> {
        let entries = self.entries.read();
        let bound = if inclusive { Included(key) } else { Excluded(key) };
        match self.direction {
            Direction::Ascending => entries
                .range((bound, Unbounded))
                .take(limit)
                .map(|(_, v)| v.clone())
                .collect(),
            Direction::Descending => entries
                .range((Unbounded, bound))
                .rev()
                .take(limit)
                .map(|(_, v)| v.clone())
                .collect(),
        }
    }

    /// The last `limit` items before `key`, in iteration order.
    pub fn range_to(&self, key: &K, inclusive: bool, limit: usize) -> Vec<V> {
        let entries = self.entries.read();
        let bound = if inclusive { Included(key) } else { Excluded(key) };
        let mut items: Vec<V> = match self.direction {
            Direction::Ascending => entries
                .range((Unbounded, bound))
                .rev()
                .take(limit)
                .map(|(_, v)| v.clone())
                .collect(),
            Direction::Descending => entries
                .range((bound, Unbounded))
                .take(limit)
                .map(|(_, v)| v.clone())
                .collect(),
        };
        items.reverse();
        items
    }

    /// `count` items starting at iteration position `start`.
    pub fn range_at(&self, start: usize, count: usize) -> Vec<V> {
        let entries = self.entries.read();
        match self.direction {
            Direction::Ascending => entries.values().skip(start).take(count).cloned().collect(),
            Direction::Descending => entries
                .values()
                .rev()
                .skip(start)
                .take(count)
                .cloned()
                .collect(),
        }
    }

    /// Number of keys preceding `key` in iteration order, whether or not
    /// `key` itself is present.
    pub fn preceding_count(&self, key: &K) -> usize {
        let entries = self.entries.read();
        match self.direction {
            Direction::Ascending => entries.range((Unbounded, Excluded(key))).count(),
            Direction::Descending => entries.range((Excluded(key), Unbounded)).count(),
        }
    }

    /// Iteration position of `key`, if present.
    pub fn position_of_key(&self, key: &K) -> Option<usize> {
        if self.contains_key(key) {
            Some(self.preceding_count(key))
        } else {
            None
        }
    }

    /// Iteration position of the entity's computed key, if present.
    pub fn position_of(&self, value: &V) -> Option<usize> {
        self.position_of_key(&self.key_of(value))
    }

    /// Initial window read.
    ///
    /// A key positioned within `clamp_threshold` of the start is treated as
    /// absent so the window begins at the first item. A key that is not in
    /// the index is never clamped: the window starts at its insertion point,
    /// not back at the first item.
    pub fn load(&self, key: Option<&K>, limit: usize, clamp_threshold: usize) -> InitialLoad<V> {
        let key = key.filter(|k| match self.position_of_key(k) {
            Some(pos) => pos > clamp_threshold,
            None => true,
        });

        match key {
            None => InitialLoad {
                items: self.range_at(0, limit),
                position: 0,
                total_count: self.len(),
            },
            Some(k) => InitialLoad {
                items: self.range_from(k, true, limit),
                position: self.preceding_count(k),
                total_count: self.len(),
            },
        }
    }
}
