//! Caches built on the ordered index.
//!
//! - [`CollectionCache`]: live ordered list of one query, debounced
//! - [`PagedCollectionCache`]: windowed reads plus boundary callbacks
//! - [`ValueCache`]: latest single value per query
//! - [`CacheRegistry`]: shares caches per (query, entity type)

mod boundary;
mod collection;
mod listener;
mod paged;
mod registry;
mod value;

pub use boundary::{BoundaryCallback, LimitWideningCallback, PagingConfig};
pub use collection::{scoped_initializer, CollectionCache, ItemInitializer};
pub use listener::QueryCacheChildListener;
pub use paged::{DataSourceKey, ItemKeyedDataSource, PagedCollectionCache};
pub use registry::CacheRegistry;
pub use value::ValueCache;
