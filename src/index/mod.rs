//! Ordered entity index.
//!
//! Entities are kept sorted by a caller-derived sort key, iterated in a
//! direction fixed at construction, and support range and position lookups
//! for paging.

mod ordered;

pub use ordered::{InitialLoad, OrderedIndex, SortKeyFn};
