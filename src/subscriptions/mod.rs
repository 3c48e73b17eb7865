//! Multiplexed remote subscriptions.
//!
//! Any number of logical listeners attached to the same query share one
//! registration with the remote source:
//! - child-stream listeners receive every child event
//! - value listeners receive every whole-value snapshot
//! - value-once listeners receive one snapshot and then detach themselves
//!
//! # Example
//!
//! ```ignore
//! let manager = SubscriptionManager::new(remote);
//! let query = QuerySpec::new("rooms/lobby/messages").limit_to_last(50);
//!
//! // First child listener registers with the remote
//! manager.subscribe(&query, &ListenerSet::child(listener.clone()))?;
//!
//! // Last one out deregisters
//! manager.unsubscribe(&query, &ListenerSet::child(listener))?;
//! ```

mod manager;
mod multiplexer;
mod types;

pub use manager::SubscriptionManager;
pub use multiplexer::SubscriptionMultiplexer;
pub use types::{ListenerKind, ListenerSet, SubscriptionStats};
