//! Scopes and the gated resources they hold.

use crate::error::{CacheError, Result};
use crate::remote::{same_listener, ChildEventListener, ValueEventListener};
use crate::scheduler::Scheduler;
use crate::subscriptions::{ListenerKind, ListenerSet, SubscriptionManager};
use crate::types::{CacheScope, QuerySpec, ScopeId};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use super::gate::DelayedLifecycleGate;

/// Called with the root query of a resource after it deactivates.
pub type DeactivateHook = Arc<dyn Fn(&QuerySpec) + Send + Sync>;

#[derive(Default)]
struct ResourceState {
    /// Listeners by (sub-)query, in registration order.
    listeners: Vec<(QuerySpec, ListenerSet)>,
    active: bool,
}

impl ResourceState {
    fn set_mut(&mut self, query: &QuerySpec) -> &mut ListenerSet {
        let idx = match self.listeners.iter().position(|(q, _)| q == query) {
            Some(idx) => idx,
            None => {
                self.listeners.push((query.clone(), ListenerSet::new()));
                self.listeners.len() - 1
            }
        };
        &mut self.listeners[idx].1
    }
}

/// The listeners of one root query and its sub-queries, subscribed while
/// the resource is active.
///
/// Consumers attach and detach through the resource's gate; the resource
/// subscribes on the gate's activation and unsubscribes on its delayed
/// deactivation.
pub struct Resource {
    query: QuerySpec,
    subscriptions: Arc<SubscriptionManager>,
    state: Mutex<ResourceState>,
    gate: Arc<DelayedLifecycleGate>,
    on_deactivate: Option<DeactivateHook>,
}

impl Resource {
    fn new(
        query: QuerySpec,
        subscriptions: Arc<SubscriptionManager>,
        scheduler: Arc<dyn Scheduler>,
        delay: Duration,
        on_deactivate: Option<DeactivateHook>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let (up, down) = (weak.clone(), weak.clone());
            let gate = DelayedLifecycleGate::new(
                query.to_string(),
                scheduler,
                delay,
                move || {
                    if let Some(resource) = up.upgrade() {
                        resource.activate();
                    }
                },
                move || {
                    if let Some(resource) = down.upgrade() {
                        resource.deactivate();
                    }
                },
            );
            Self {
                query,
                subscriptions,
                state: Mutex::new(ResourceState::default()),
                gate,
                on_deactivate,
            }
        })
    }

    /// Root query of this resource.
    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    pub fn gate(&self) -> &Arc<DelayedLifecycleGate> {
        &self.gate
    }

    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Register a consumer of this resource.
    pub fn attach(&self) {
        self.gate.attach();
    }

    /// Unregister a consumer; see [`DelayedLifecycleGate::detach`].
    pub fn detach(&self, delay: Option<Duration>) -> Result<()> {
        self.gate.detach(delay)
    }

    /// Add a child-stream listener on the root query.
    pub fn add_child_listener(&self, listener: Arc<dyn ChildEventListener>) -> Result<()> {
        let query = self.query.clone();
        self.add_sub_query(&query, ListenerSet::child(listener))
    }

    /// Add a value listener on the root query.
    pub fn add_value_listener(&self, listener: Arc<dyn ValueEventListener>) -> Result<()> {
        let query = self.query.clone();
        self.add_sub_query(&query, ListenerSet::value(listener))
    }

    /// Add a one-shot value listener on the root query.
    pub fn add_single_value_listener(&self, listener: Arc<dyn ValueEventListener>) -> Result<()> {
        let query = self.query.clone();
        self.add_sub_query(&query, ListenerSet::value_once(listener))
    }

    /// Add listeners for `query`, subscribing them immediately when the
    /// resource is already active.
    pub fn add_sub_query(&self, query: &QuerySpec, listeners: ListenerSet) -> Result<()> {
        let active = {
            let mut state = self.state.lock();
            let set = state.set_mut(query);
            if let Some(kind) = overlapping(set, &listeners) {
                return Err(CacheError::DuplicateListener {
                    query: query.clone(),
                    kind,
                });
            }
            set.child.extend(listeners.child.iter().cloned());
            set.value.extend(listeners.value.iter().cloned());
            set.value_once.extend(listeners.value_once.iter().cloned());
            state.active
        };

        if active {
            self.subscriptions.subscribe(query, &listeners)?;
        }
        Ok(())
    }

    /// Remove listeners for `query`, unsubscribing them when active.
    pub fn remove_sub_query(&self, query: &QuerySpec, listeners: &ListenerSet) -> Result<()> {
        let (active, removed) = {
            let mut state = self.state.lock();
            let Some(idx) = state.listeners.iter().position(|(q, _)| q == query) else {
                return Ok(());
            };
            let set = &mut state.listeners[idx].1;
            let removed = ListenerSet {
                child: take_matching(&mut set.child, &listeners.child),
                value: take_matching(&mut set.value, &listeners.value),
                value_once: take_matching(&mut set.value_once, &listeners.value_once),
            };
            if set.is_empty() {
                state.listeners.remove(idx);
            }
            (state.active, removed)
        };

        if active {
            let removed = self.still_subscribed(query, removed);
            self.subscriptions.unsubscribe(query, &removed)?;
        }
        Ok(())
    }

    /// Subscribe every registered listener. Idempotent.
    pub fn activate(&self) {
        let sets = {
            let mut state = self.state.lock();
            if state.active {
                return;
            }
            state.active = true;
            state.listeners.clone()
        };

        debug!(query = %self.query, queries = sets.len(), "Resource activating");
        for (query, set) in sets {
            if let Err(e) = self.subscriptions.subscribe(&query, &set) {
                warn!(query = %query, error = %e, "Failed to subscribe resource listeners");
            }
        }
    }

    /// Unsubscribe every registered listener. Idempotent.
    pub fn deactivate(&self) {
        let sets = {
            let mut state = self.state.lock();
            if !state.active {
                return;
            }
            state.active = false;
            state.listeners.clone()
        };

        debug!(query = %self.query, queries = sets.len(), "Resource deactivating");
        for (query, set) in sets {
            let set = self.still_subscribed(&query, set);
            if let Err(e) = self.subscriptions.unsubscribe(&query, &set) {
                warn!(query = %query, error = %e, "Failed to unsubscribe resource listeners");
            }
        }

        if let Some(ref hook) = self.on_deactivate {
            hook(&self.query);
        }
    }

    /// Drop one-shot listeners the multiplexer already detached after
    /// delivery.
    fn still_subscribed(&self, query: &QuerySpec, mut set: ListenerSet) -> ListenerSet {
        if set.value_once.is_empty() {
            return set;
        }
        let mux = self.subscriptions.multiplexer(query);
        set.value_once.retain(|l| mux.contains_value_listener(l));
        set
    }
}

fn overlapping(existing: &ListenerSet, incoming: &ListenerSet) -> Option<ListenerKind> {
    let any = |a: &[Arc<dyn ChildEventListener>], b: &[Arc<dyn ChildEventListener>]| {
        b.iter().any(|x| a.iter().any(|y| same_listener(x, y)))
    };
    let any_value = |a: &[Arc<dyn ValueEventListener>], b: &[Arc<dyn ValueEventListener>]| {
        b.iter().any(|x| a.iter().any(|y| same_listener(x, y)))
    };
    if any(&existing.child, &incoming.child) {
        Some(ListenerKind::Child)
    } else if any_value(&existing.value, &incoming.value) {
        Some(ListenerKind::Value)
    } else if any_value(&existing.value_once, &incoming.value_once) {
        Some(ListenerKind::ValueOnce)
    } else {
        None
    }
}

fn take_matching<T: ?Sized>(bucket: &mut Vec<Arc<T>>, targets: &[Arc<T>]) -> Vec<Arc<T>> {
    let mut taken = Vec::new();
    bucket.retain(|l| {
        if targets.iter().any(|t| same_listener(l, t)) {
            taken.push(l.clone());
            false
        } else {
            true
        }
    });
    taken
}

// --- Scope ---

/// Maps root queries to their gated resources.
pub struct Scope {
    id: ScopeId,
    subscriptions: Arc<SubscriptionManager>,
    scheduler: Arc<dyn Scheduler>,
    default_delay: Duration,
    resources: RwLock<HashMap<QuerySpec, Arc<Resource>>>,
    on_deactivate: RwLock<Option<DeactivateHook>>,
}

impl Scope {
    pub fn new(
        subscriptions: Arc<SubscriptionManager>,
        scheduler: Arc<dyn Scheduler>,
        default_delay: Duration,
    ) -> Self {
        Self {
            id: ScopeId::next(),
            subscriptions,
            scheduler,
            default_delay,
            resources: RwLock::new(HashMap::new()),
            on_deactivate: RwLock::new(None),
        }
    }

    pub fn id(&self) -> ScopeId {
        self.id
    }

    pub fn default_delay(&self) -> Duration {
        self.default_delay
    }

    /// Hook passed to resources created after this call.
    pub fn set_deactivate_hook(&self, hook: DeactivateHook) {
        *self.on_deactivate.write() = Some(hook);
    }

    /// Get the resource for a root query, creating it on first use.
    pub fn resource(&self, query: &QuerySpec) -> Arc<Resource> {
        if let Some(existing) = self.resources.read().get(query) {
            return existing.clone();
        }

        let hook = self.on_deactivate.read().clone();
        self.resources
            .write()
            .entry(query.clone())
            .or_insert_with(|| {
                Resource::new(
                    query.clone(),
                    self.subscriptions.clone(),
                    self.scheduler.clone(),
                    self.default_delay,
                    hook,
                )
            })
            .clone()
    }

    /// Existing resource for a query, without creating one.
    pub fn get(&self, query: &QuerySpec) -> Option<Arc<Resource>> {
        self.resources.read().get(query).cloned()
    }

    /// Handle an entity keeps to find its way back to this scope.
    pub fn handle(&self, query: &QuerySpec) -> CacheScope {
        CacheScope {
            scope: self.id,
            query: query.clone(),
        }
    }

    /// Resolve a handle issued by this scope.
    pub fn resolve(&self, handle: &CacheScope) -> Option<Arc<Resource>> {
        if handle.scope != self.id {
            return None;
        }
        Some(self.resource(&handle.query))
    }
}
