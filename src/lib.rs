//! # Canopy
//!
//! A client-side synchronization cache for live, ordered data held by a
//! remote hierarchical store.
//!
//! ## Core Concepts
//!
//! - **Queries**: A path plus ordering, bounds and an anchored limit
//! - **Subscriptions**: One remote registration per query, fanned out to local listeners
//! - **Resources**: Reference-counted query lifetimes with a delayed disconnect
//! - **Caches**: Ordered, deduplicated collections that republish on change
//! - **Paging**: Key-anchored windows over a cache, grown at their edges
//!
//! ## Example
//!
//! ```ignore
//! use canopy::{CacheConfig, CacheContext, QuerySpec};
//!
//! let context = CacheContext::with_thread_scheduler(remote, CacheConfig::default())?;
//!
//! let query = QuerySpec::new("rooms/lobby/messages")
//!     .order_by_child("sent_at")
//!     .limit_to_last(50);
//!
//! // Subscribed while observed, disconnected 10s after the last observer leaves
//! let messages = context.list(&query, |m: &Message| m.sent_at, None)?;
//! let _sub = messages.subscribe(|delivery| {
//!     if let Ok(list) = delivery {
//!         println!("{} messages", list.len());
//!     }
//! });
//! ```

pub mod cache;
pub mod context;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod observable;
pub mod remote;
pub mod scheduler;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use cache::{
    scoped_initializer, BoundaryCallback, CacheRegistry, CollectionCache, DataSourceKey,
    ItemInitializer, ItemKeyedDataSource, LimitWideningCallback, PagedCollectionCache,
    PagingConfig, QueryCacheChildListener, ValueCache,
};
pub use context::{CacheConfig, CacheContext};
pub use error::{CacheError, Result};
pub use index::{InitialLoad, OrderedIndex, SortKeyFn};
pub use lifecycle::{DeactivateHook, DelayedLifecycleGate, Resource, Scope};
pub use observable::{Delivery, Observable, Subscription, WeakObservable};
pub use remote::{ChildEventListener, RemoteSource, ValueEventListener};
pub use scheduler::{ManualScheduler, Scheduler, Task, ThreadScheduler, TimerHandle};
pub use subscriptions::{
    ListenerKind, ListenerSet, SubscriptionManager, SubscriptionMultiplexer, SubscriptionStats,
};
pub use types::*;
