//! Connection lifecycle.
//!
//! Subscribing happens as soon as a consumer attaches; unsubscribing waits
//! until a resource has had no consumers for its disconnect delay, so rapid
//! attach/detach churn never reaches the remote source.

mod gate;
mod scope;

pub use gate::DelayedLifecycleGate;
pub use scope::{DeactivateHook, Resource, Scope};
