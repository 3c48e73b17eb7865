//! One remote subscription fanned out to many logical listeners.

use crate::error::{CacheError, Result};
use crate::remote::{same_listener, ChildEventListener, RemoteSource, ValueEventListener};
use crate::types::{QuerySpec, RemoteError, Snapshot};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::{Arc, Weak};
use tracing::{debug, error, trace};

use super::types::{ListenerKind, ListenerSet, SubscriptionStats};

/// Listener buckets and counters.
#[derive(Default)]
struct Buckets {
    child: Vec<Arc<dyn ChildEventListener>>,
    value: Vec<Arc<dyn ValueEventListener>>,
    value_once: Vec<Arc<dyn ValueEventListener>>,
    child_count: usize,
    /// Shared by value and value-once listeners.
    value_count: usize,
    child_registered: bool,
    value_registered: bool,
}

/// Remote registrations to perform once the bucket lock is released.
#[derive(Default)]
struct RemoteCalls {
    add_child: bool,
    add_value: bool,
    remove_child: bool,
    remove_value: bool,
}

/// Shares one remote subscription per query among any number of listeners.
///
/// The remote registration for a kind happens on its 0 to 1 transition and
/// the deregistration on its 1 to 0 transition. Deliveries run outside the
/// bucket lock. Each transition holds `transitions` until its remote call
/// returns, so concurrent callers reach the remote in decision order.
pub struct SubscriptionMultiplexer {
    query: QuerySpec,
    remote: Arc<dyn RemoteSource>,
    buckets: Mutex<Buckets>,
    /// Reentrant: a remote may deliver synchronously from inside a call.
    transitions: ReentrantMutex<()>,
    child_fanout: Arc<dyn ChildEventListener>,
    value_fanout: Arc<dyn ValueEventListener>,
}

impl SubscriptionMultiplexer {
    pub fn new(query: QuerySpec, remote: Arc<dyn RemoteSource>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| Self {
            query,
            remote,
            buckets: Mutex::new(Buckets::default()),
            transitions: ReentrantMutex::new(()),
            child_fanout: Arc::new(ChildFanOut {
                owner: weak.clone(),
            }),
            value_fanout: Arc::new(ValueFanOut {
                owner: weak.clone(),
            }),
        })
    }

    pub fn query(&self) -> &QuerySpec {
        &self.query
    }

    /// Attach listeners.
    ///
    /// Fails without attaching anything if any listener is already attached
    /// to this query with the same kind.
    pub fn subscribe(&self, set: &ListenerSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        let _transition = self.transitions.lock();
        let calls = {
            let mut b = self.buckets.lock();

            if let Some(kind) = self.find_duplicate(&b, set) {
                error!(query = %self.query, kind = ?kind, "Listener already registered");
                return Err(CacheError::DuplicateListener {
                    query: self.query.clone(),
                    kind,
                });
            }

            b.child.extend(set.child.iter().cloned());
            b.value.extend(set.value.iter().cloned());
            b.value_once.extend(set.value_once.iter().cloned());
            b.child_count += set.child.len();
            b.value_count += set.value_len();

            let mut calls = RemoteCalls::default();
            if b.child_count > 0 && !b.child_registered {
                b.child_registered = true;
                calls.add_child = true;
            }
            if b.value_count > 0 && !b.value_registered {
                b.value_registered = true;
                calls.add_value = true;
            }
            calls
        };

        self.apply(calls);
        Ok(())
    }

    /// Detach listeners.
    ///
    /// Listeners that are not attached are skipped. Fails without detaching
    /// anything if a kind with listeners in `set` has a count of zero.
    pub fn unsubscribe(&self, set: &ListenerSet) -> Result<()> {
        if set.is_empty() {
            return Ok(());
        }

        let _transition = self.transitions.lock();
        let calls = {
            let mut b = self.buckets.lock();

            if !set.child.is_empty() && b.child_count == 0 {
                return Err(self.underflow(ListenerKind::Child));
            }
            if set.value_len() > 0 && b.value_count == 0 {
                let kind = if set.value.is_empty() {
                    ListenerKind::ValueOnce
                } else {
                    ListenerKind::Value
                };
                return Err(self.underflow(kind));
            }

            let removed_child = remove_all(&mut b.child, &set.child);
            let removed_value = remove_all(&mut b.value, &set.value)
                + remove_all(&mut b.value_once, &set.value_once);
            b.child_count -= removed_child;
            b.value_count -= removed_value;

            let mut calls = RemoteCalls::default();
            if b.child_count == 0 && b.child_registered {
                b.child_registered = false;
                calls.remove_child = true;
            }
            if b.value_count == 0 && b.value_registered {
                b.value_registered = false;
                calls.remove_value = true;
            }
            calls
        };

        self.apply(calls);
        Ok(())
    }

    pub fn contains_child_listener(&self, listener: &Arc<dyn ChildEventListener>) -> bool {
        self.buckets
            .lock()
            .child
            .iter()
            .any(|l| same_listener(l, listener))
    }

    pub fn contains_value_listener(&self, listener: &Arc<dyn ValueEventListener>) -> bool {
        let b = self.buckets.lock();
        b.value
            .iter()
            .chain(b.value_once.iter())
            .any(|l| same_listener(l, listener))
    }

    pub fn stats(&self) -> SubscriptionStats {
        let b = self.buckets.lock();
        SubscriptionStats {
            child_listeners: b.child_count,
            value_listeners: b.value_count,
            child_registered: b.child_registered,
            value_registered: b.value_registered,
        }
    }

    /// True if any listener of any kind is attached.
    pub fn is_active(&self) -> bool {
        let b = self.buckets.lock();
        b.child_count > 0 || b.value_count > 0
    }

    fn find_duplicate(&self, b: &Buckets, set: &ListenerSet) -> Option<ListenerKind> {
        if has_duplicate(&b.child, &set.child) {
            return Some(ListenerKind::Child);
        }
        if has_duplicate(&b.value, &set.value) {
            return Some(ListenerKind::Value);
        }
        if has_duplicate(&b.value_once, &set.value_once) {
            return Some(ListenerKind::ValueOnce);
        }
        None
    }

    fn underflow(&self, kind: ListenerKind) -> CacheError {
        error!(query = %self.query, kind = ?kind, "Unsubscribe with no subscriptions");
        CacheError::SubscriptionUnderflow {
            query: self.query.clone(),
            kind,
        }
    }

    fn apply(&self, calls: RemoteCalls) {
        if calls.add_child {
            debug!(query = %self.query, "Registering child listener with remote");
            self.remote
                .add_child_listener(&self.query, self.child_fanout.clone());
        }
        if calls.add_value {
            debug!(query = %self.query, "Registering value listener with remote");
            self.remote
                .add_value_listener(&self.query, self.value_fanout.clone());
        }
        if calls.remove_child {
            debug!(query = %self.query, "Removing child listener from remote");
            self.remote
                .remove_child_listener(&self.query, &self.child_fanout);
        }
        if calls.remove_value {
            debug!(query = %self.query, "Removing value listener from remote");
            self.remote
                .remove_value_listener(&self.query, &self.value_fanout);
        }
    }

    fn child_listeners(&self) -> Vec<Arc<dyn ChildEventListener>> {
        self.buckets.lock().child.clone()
    }

    /// Snapshot value listeners, draining one-shot listeners.
    fn take_value_listeners(&self) -> Vec<Arc<dyn ValueEventListener>> {
        let _transition = self.transitions.lock();
        let (listeners, remove) = {
            let mut b = self.buckets.lock();
            let once = std::mem::take(&mut b.value_once);
            b.value_count -= once.len();
            let mut remove = false;
            if b.value_count == 0 && b.value_registered {
                b.value_registered = false;
                remove = true;
            }
            let mut listeners = b.value.clone();
            listeners.extend(once);
            (listeners, remove)
        };

        if remove {
            self.apply(RemoteCalls {
                remove_value: true,
                ..Default::default()
            });
        }
        listeners
    }
}

fn has_duplicate<T: ?Sized>(existing: &[Arc<T>], incoming: &[Arc<T>]) -> bool {
    incoming.iter().enumerate().any(|(i, l)| {
        existing.iter().any(|e| same_listener(e, l))
            || incoming[..i].iter().any(|e| same_listener(e, l))
    })
}

fn remove_all<T: ?Sized>(bucket: &mut Vec<Arc<T>>, targets: &[Arc<T>]) -> usize {
    let before = bucket.len();
    bucket.retain(|l| !targets.iter().any(|t| same_listener(l, t)));
    before - bucket.len()
}

// --- Fan-out ---

struct ChildFanOut {
    owner: Weak<SubscriptionMultiplexer>,
}

impl ChildFanOut {
    fn listeners(&self) -> Vec<Arc<dyn ChildEventListener>> {
        self.owner
            .upgrade()
            .map(|m| m.child_listeners())
            .unwrap_or_default()
    }
}

impl ChildEventListener for ChildFanOut {
    fn on_child_added(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        trace!(key = %snapshot.key, "Fan-out child added");
        for l in self.listeners() {
            l.on_child_added(previous_sibling, snapshot);
        }
    }

    fn on_child_changed(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        trace!(key = %snapshot.key, "Fan-out child changed");
        for l in self.listeners() {
            l.on_child_changed(previous_sibling, snapshot);
        }
    }

    fn on_child_removed(&self, snapshot: &Snapshot) {
        trace!(key = %snapshot.key, "Fan-out child removed");
        for l in self.listeners() {
            l.on_child_removed(snapshot);
        }
    }

    fn on_child_moved(&self, previous_sibling: Option<&str>, snapshot: &Snapshot) {
        for l in self.listeners() {
            l.on_child_moved(previous_sibling, snapshot);
        }
    }

    fn on_cancelled(&self, error: &RemoteError) {
        for l in self.listeners() {
            l.on_cancelled(error);
        }
    }
}

struct ValueFanOut {
    owner: Weak<SubscriptionMultiplexer>,
}

impl ValueEventListener for ValueFanOut {
    fn on_data_change(&self, snapshot: &Snapshot) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        trace!(query = %owner.query, key = %snapshot.key, "Fan-out value");
        for l in owner.take_value_listeners() {
            l.on_data_change(snapshot);
        }
    }

    fn on_cancelled(&self, error: &RemoteError) {
        let Some(owner) = self.owner.upgrade() else {
            return;
        };
        let listeners: Vec<_> = {
            let b = owner.buckets.lock();
            b.value.iter().chain(b.value_once.iter()).cloned().collect()
        };
        for l in listeners {
            l.on_cancelled(error);
        }
    }
}
