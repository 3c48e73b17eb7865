//! Contract of the remote live-tree source.
//!
//! The transport itself lives outside this crate. It delivers ordered child
//! events and whole-value snapshots for a [`QuerySpec`], keyed by stable ids.

use crate::types::{QuerySpec, RemoteError, Snapshot};
use std::sync::Arc;

/// Receives child-stream events for one query.
///
/// `previous_sibling` is the id of the child immediately before this one in
/// the remote's natural order, or `None` if it is first.
pub trait ChildEventListener: Send + Sync {
    fn on_child_added(&self, previous_sibling: Option<&str>, snapshot: &Snapshot);
    fn on_child_changed(&self, previous_sibling: Option<&str>, snapshot: &Snapshot);
    fn on_child_removed(&self, snapshot: &Snapshot);
    fn on_child_moved(&self, previous_sibling: Option<&str>, snapshot: &Snapshot);
    fn on_cancelled(&self, error: &RemoteError);
}

/// Receives whole-value snapshots for one query.
pub trait ValueEventListener: Send + Sync {
    fn on_data_change(&self, snapshot: &Snapshot);
    fn on_cancelled(&self, error: &RemoteError);
}

/// Subscribe/unsubscribe pair per logical query.
///
/// Registrations are fire-and-forget; events arrive later on whatever thread
/// the transport uses.
pub trait RemoteSource: Send + Sync {
    fn add_child_listener(&self, query: &QuerySpec, listener: Arc<dyn ChildEventListener>);
    fn remove_child_listener(&self, query: &QuerySpec, listener: &Arc<dyn ChildEventListener>);
    fn add_value_listener(&self, query: &QuerySpec, listener: Arc<dyn ValueEventListener>);
    fn remove_value_listener(&self, query: &QuerySpec, listener: &Arc<dyn ValueEventListener>);
}

/// Compare two listener handles by identity.
pub(crate) fn same_listener<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}
