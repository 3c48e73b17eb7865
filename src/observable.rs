//! Push-style observable with lazy activation hooks.

use crate::types::RemoteError;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tracing::trace;

/// A value or the remote error that replaced it.
pub type Delivery<T> = std::result::Result<T, RemoteError>;

type Callback<T> = Arc<dyn Fn(&Delivery<T>) + Send + Sync>;
type Hook = Arc<dyn Fn() + Send + Sync>;

struct State<T> {
    value: Option<Delivery<T>>,
    observers: Vec<(u64, Callback<T>)>,
    next_id: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    on_active: Option<Hook>,
    on_inactive: Option<Hook>,
}

/// Shared, thread-safe holder of the latest delivered value.
///
/// New observers receive the current value immediately. The first observer
/// fires the `on_active` hook and the last one to detach fires `on_inactive`.
pub struct Observable<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    /// An observable without hooks.
    pub fn new() -> Self {
        Self::build(None, None)
    }

    /// An observable that reports its active/inactive transitions.
    pub fn with_hooks(
        on_active: impl Fn() + Send + Sync + 'static,
        on_inactive: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self::build(Some(Arc::new(on_active)), Some(Arc::new(on_inactive)))
    }

    fn build(on_active: Option<Hook>, on_inactive: Option<Hook>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value: None,
                    observers: Vec::new(),
                    next_id: 0,
                }),
                on_active,
                on_inactive,
            }),
        }
    }

    /// Register an observer. Dropping the returned guard detaches it.
    pub fn subscribe(&self, callback: impl Fn(&Delivery<T>) + Send + Sync + 'static) -> Subscription {
        let callback: Callback<T> = Arc::new(callback);
        let (id, first, current) = {
            let mut state = self.inner.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.observers.push((id, callback.clone()));
            (id, state.observers.len() == 1, state.value.clone())
        };

        if let Some(value) = current {
            callback(&value);
        }

        if first {
            trace!("Observable became active");
            if let Some(ref hook) = self.inner.on_active {
                hook();
            }
        }

        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(inner) = weak.upgrade() {
                    detach_observer(&inner, id);
                }
            })),
        }
    }

    /// Publish a new value to every observer.
    pub fn post(&self, value: T) {
        self.deliver(Ok(value));
    }

    /// Publish a remote error in place of the next value.
    pub fn post_error(&self, error: RemoteError) {
        self.deliver(Err(error));
    }

    fn deliver(&self, value: Delivery<T>) {
        let observers: Vec<Callback<T>> = {
            let mut state = self.inner.state.lock();
            state.value = Some(value.clone());
            state.observers.iter().map(|(_, cb)| cb.clone()).collect()
        };
        for observer in observers {
            observer(&value);
        }
    }

    /// The last delivered value, if any.
    pub fn current(&self) -> Option<Delivery<T>> {
        self.inner.state.lock().value.clone()
    }

    pub fn observer_count(&self) -> usize {
        self.inner.state.lock().observers.len()
    }

    pub fn has_observers(&self) -> bool {
        self.observer_count() > 0
    }
}

/// Non-owning handle to an [`Observable`].
pub struct WeakObservable<T> {
    inner: Weak<Inner<T>>,
}

impl<T> Clone for WeakObservable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Observable<T> {
    pub fn downgrade(&self) -> WeakObservable<T> {
        WeakObservable {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl<T> WeakObservable<T> {
    pub fn upgrade(&self) -> Option<Observable<T>> {
        self.inner.upgrade().map(|inner| Observable { inner })
    }
}

fn detach_observer<T>(inner: &Inner<T>, id: u64) {
    let last = {
        let mut state = inner.state.lock();
        let before = state.observers.len();
        state.observers.retain(|(oid, _)| *oid != id);
        before > 0 && state.observers.is_empty() && before != state.observers.len()
    };

    if last {
        trace!("Observable became inactive");
        if let Some(ref hook) = inner.on_inactive {
            hook();
        }
    }
}

/// Detaches its observer when dropped.
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detach now rather than at drop.
    pub fn unsubscribe(mut self) {
        self.run_detach();
    }

    fn run_detach(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.run_detach();
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("attached", &self.detach.is_some())
            .finish()
    }
}
