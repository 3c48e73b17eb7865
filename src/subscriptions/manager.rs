//! Per-query table of subscription multiplexers.

use crate::error::Result;
use crate::remote::RemoteSource;
use crate::types::QuerySpec;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::multiplexer::SubscriptionMultiplexer;
use super::types::{ListenerSet, SubscriptionStats};

/// Owns one [`SubscriptionMultiplexer`] per distinct [`QuerySpec`].
pub struct SubscriptionManager {
    remote: Arc<dyn RemoteSource>,
    multiplexers: RwLock<HashMap<QuerySpec, Arc<SubscriptionMultiplexer>>>,
}

impl SubscriptionManager {
    pub fn new(remote: Arc<dyn RemoteSource>) -> Self {
        Self {
            remote,
            multiplexers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the multiplexer for a query, creating it on first use.
    pub fn multiplexer(&self, query: &QuerySpec) -> Arc<SubscriptionMultiplexer> {
        if let Some(existing) = self.multiplexers.read().get(query) {
            return existing.clone();
        }

        self.multiplexers
            .write()
            .entry(query.clone())
            .or_insert_with(|| SubscriptionMultiplexer::new(query.clone(), self.remote.clone()))
            .clone()
    }

    pub fn subscribe(&self, query: &QuerySpec, listeners: &ListenerSet) -> Result<()> {
        self.multiplexer(query).subscribe(listeners)
    }

    pub fn unsubscribe(&self, query: &QuerySpec, listeners: &ListenerSet) -> Result<()> {
        self.multiplexer(query).unsubscribe(listeners)
    }

    /// Counters for a query, if it was ever subscribed.
    pub fn stats(&self, query: &QuerySpec) -> Option<SubscriptionStats> {
        self.multiplexers.read().get(query).map(|m| m.stats())
    }

    /// Number of queries with at least one attached listener.
    pub fn active_count(&self) -> usize {
        self.multiplexers
            .read()
            .values()
            .filter(|m| m.is_active())
            .count()
    }
}
