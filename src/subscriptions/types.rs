//! Listener kinds and listener sets.

use crate::remote::{ChildEventListener, ValueEventListener};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Kind of logical listener attached to a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerKind {
    /// Receives every child added/changed/removed/moved event.
    Child,
    /// Receives every whole-value snapshot.
    Value,
    /// Receives the next whole-value snapshot, then unregisters itself.
    ValueOnce,
}

/// Listeners subscribed or unsubscribed together on one query.
#[derive(Clone, Default)]
pub struct ListenerSet {
    pub child: Vec<Arc<dyn ChildEventListener>>,
    pub value: Vec<Arc<dyn ValueEventListener>>,
    pub value_once: Vec<Arc<dyn ValueEventListener>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn child(listener: Arc<dyn ChildEventListener>) -> Self {
        Self {
            child: vec![listener],
            ..Default::default()
        }
    }

    pub fn value(listener: Arc<dyn ValueEventListener>) -> Self {
        Self {
            value: vec![listener],
            ..Default::default()
        }
    }

    pub fn value_once(listener: Arc<dyn ValueEventListener>) -> Self {
        Self {
            value_once: vec![listener],
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.child.is_empty() && self.value.is_empty() && self.value_once.is_empty()
    }

    /// Value and value-once listeners share one count.
    pub fn value_len(&self) -> usize {
        self.value.len() + self.value_once.len()
    }
}

impl std::fmt::Debug for ListenerSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerSet")
            .field("child", &self.child.len())
            .field("value", &self.value.len())
            .field("value_once", &self.value_once.len())
            .finish()
    }
}

/// Counters of one multiplexer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionStats {
    /// Child-stream listeners attached.
    pub child_listeners: usize,
    /// Value and value-once listeners attached.
    pub value_listeners: usize,
    /// Whether the child fan-out is registered with the remote.
    pub child_registered: bool,
    /// Whether the value fan-out is registered with the remote.
    pub value_registered: bool,
}
