//! Shared fixtures for integration tests.

#![allow(dead_code)]

use canopy::{
    CacheContext, CacheConfig, CacheScope, ChildEventListener, Entity, FromWireSnapshot,
    ManualScheduler, QuerySpec, RemoteError, RemoteSource, Result, Scoped, Snapshot,
    ValueEventListener,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

// --- Entity ---

#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub id: String,
    pub text: String,
    pub sent_at: i64,
    pub scope: Option<CacheScope>,
}

#[derive(Deserialize)]
struct WireMessage {
    text: String,
    sent_at: i64,
}

impl Entity for Message {
    fn entity_id(&self) -> &str {
        &self.id
    }
}

impl FromWireSnapshot for Message {
    fn from_snapshot(snapshot: &Snapshot) -> Result<Self> {
        let wire: WireMessage = snapshot.deserialize()?;
        Ok(Message {
            id: snapshot.key.as_str().to_owned(),
            text: wire.text,
            sent_at: wire.sent_at,
            scope: None,
        })
    }
}

impl Scoped for Message {
    fn attach_scope(&mut self, scope: &CacheScope) {
        self.scope = Some(scope.clone());
    }
}

pub fn sent_at(message: &Message) -> i64 {
    message.sent_at
}

pub fn message(id: &str, sent_at: i64) -> Snapshot {
    Snapshot::new(id, json!({ "text": format!("message {}", id), "sent_at": sent_at }))
}

pub fn times(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.sent_at).collect()
}

// --- Remote ---

#[derive(Default)]
struct Registrations {
    child: Vec<Arc<dyn ChildEventListener>>,
    value: Vec<Arc<dyn ValueEventListener>>,
}

/// In-memory remote recording registrations per query.
///
/// Events are pushed to whatever is registered at the time, outside the
/// registration lock.
#[derive(Default)]
pub struct FakeRemote {
    queries: Mutex<HashMap<QuerySpec, Registrations>>,
    adds: Mutex<usize>,
    removes: Mutex<usize>,
}

impl FakeRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn child_listeners(&self, query: &QuerySpec) -> usize {
        self.queries.lock().get(query).map_or(0, |r| r.child.len())
    }

    pub fn value_listeners(&self, query: &QuerySpec) -> usize {
        self.queries.lock().get(query).map_or(0, |r| r.value.len())
    }

    pub fn is_subscribed(&self, query: &QuerySpec) -> bool {
        self.child_listeners(query) + self.value_listeners(query) > 0
    }

    /// Queries with at least one registration.
    pub fn subscribed_queries(&self) -> Vec<QuerySpec> {
        self.queries
            .lock()
            .iter()
            .filter(|(_, r)| !r.child.is_empty() || !r.value.is_empty())
            .map(|(q, _)| q.clone())
            .collect()
    }

    pub fn add_count(&self) -> usize {
        *self.adds.lock()
    }

    pub fn remove_count(&self) -> usize {
        *self.removes.lock()
    }

    fn children(&self, query: &QuerySpec) -> Vec<Arc<dyn ChildEventListener>> {
        self.queries.lock().get(query).map(|r| r.child.clone()).unwrap_or_default()
    }

    fn values(&self, query: &QuerySpec) -> Vec<Arc<dyn ValueEventListener>> {
        self.queries.lock().get(query).map(|r| r.value.clone()).unwrap_or_default()
    }

    pub fn child_added(&self, query: &QuerySpec, previous: Option<&str>, snapshot: Snapshot) {
        for listener in self.children(query) {
            listener.on_child_added(previous, &snapshot);
        }
    }

    pub fn child_changed(&self, query: &QuerySpec, previous: Option<&str>, snapshot: Snapshot) {
        for listener in self.children(query) {
            listener.on_child_changed(previous, &snapshot);
        }
    }

    pub fn child_removed(&self, query: &QuerySpec, snapshot: Snapshot) {
        for listener in self.children(query) {
            listener.on_child_removed(&snapshot);
        }
    }

    pub fn child_cancelled(&self, query: &QuerySpec, error: RemoteError) {
        for listener in self.children(query) {
            listener.on_cancelled(&error);
        }
    }

    pub fn value(&self, query: &QuerySpec, snapshot: Snapshot) {
        for listener in self.values(query) {
            listener.on_data_change(&snapshot);
        }
    }

    /// Deliver `count` children in ascending order starting at `first`.
    pub fn fill(&self, query: &QuerySpec, first: i64, count: i64) {
        let mut previous: Option<String> = None;
        for n in first..first + count {
            let id = format!("m{:04}", n);
            self.child_added(query, previous.as_deref(), message(&id, n));
            previous = Some(id);
        }
    }
}

impl RemoteSource for FakeRemote {
    fn add_child_listener(&self, query: &QuerySpec, listener: Arc<dyn ChildEventListener>) {
        *self.adds.lock() += 1;
        self.queries.lock().entry(query.clone()).or_default().child.push(listener);
    }

    fn remove_child_listener(&self, query: &QuerySpec, listener: &Arc<dyn ChildEventListener>) {
        *self.removes.lock() += 1;
        if let Some(r) = self.queries.lock().get_mut(query) {
            r.child.retain(|l| !same(l, listener));
        }
    }

    fn add_value_listener(&self, query: &QuerySpec, listener: Arc<dyn ValueEventListener>) {
        *self.adds.lock() += 1;
        self.queries.lock().entry(query.clone()).or_default().value.push(listener);
    }

    fn remove_value_listener(&self, query: &QuerySpec, listener: &Arc<dyn ValueEventListener>) {
        *self.removes.lock() += 1;
        if let Some(r) = self.queries.lock().get_mut(query) {
            r.value.retain(|l| !same(l, listener));
        }
    }
}

fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

// --- Context ---

pub struct Harness {
    pub remote: Arc<FakeRemote>,
    pub scheduler: Arc<ManualScheduler>,
    pub context: CacheContext,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    pub fn with_config(config: CacheConfig) -> Self {
        init_tracing();
        let remote = FakeRemote::new();
        let scheduler = Arc::new(ManualScheduler::new());
        let context = CacheContext::new(remote.clone(), scheduler.clone(), config);
        Self {
            remote,
            scheduler,
            context,
        }
    }

    /// Run everything due within the debounce window.
    pub fn settle(&self) {
        self.scheduler.advance(Duration::from_millis(300));
    }

    pub fn advance(&self, by: Duration) {
        self.scheduler.advance(by);
    }
}
