//! Core types for the cache.

use crate::error::{CacheError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Stable identifier of an entity, assigned by the remote source.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.0)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        EntityId(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        EntityId(s)
    }
}

/// Iteration order of an ordered index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Direction {
    #[default]
    Ascending,
    Descending,
}

// --- Query Identity ---

/// A value the remote source can order by natively.
///
/// Only JSON numbers, strings and booleans are valid query bounds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BoundValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl BoundValue {
    /// Convert a sort key into a bound value.
    ///
    /// Fails with [`CacheError::UnsupportedKeyType`] when the key does not
    /// serialize to a JSON number, string or boolean.
    pub fn from_key<K: Serialize + ?Sized>(key: &K) -> Result<Self> {
        match serde_json::to_value(key)? {
            serde_json::Value::Bool(b) => Ok(BoundValue::Bool(b)),
            serde_json::Value::String(s) => Ok(BoundValue::String(s)),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map(BoundValue::Number)
                .ok_or_else(|| CacheError::UnsupportedKeyType(n.to_string())),
            other => Err(CacheError::UnsupportedKeyType(other.to_string())),
        }
    }
}

impl PartialEq for BoundValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (BoundValue::Bool(a), BoundValue::Bool(b)) => a == b,
            (BoundValue::Number(a), BoundValue::Number(b)) => a.to_bits() == b.to_bits(),
            (BoundValue::String(a), BoundValue::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for BoundValue {}

impl Hash for BoundValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            BoundValue::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            BoundValue::Number(n) => {
                1u8.hash(state);
                n.to_bits().hash(state);
            }
            BoundValue::String(s) => {
                2u8.hash(state);
                s.hash(state);
            }
        }
    }
}

impl fmt::Display for BoundValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BoundValue::Bool(b) => write!(f, "{}", b),
            BoundValue::Number(n) => write!(f, "{}", n),
            BoundValue::String(s) => write!(f, "\"{}\"", s),
        }
    }
}

/// What the remote source orders children by.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OrderBy {
    #[default]
    Key,
    Value,
    Priority,
    Child(String),
}

/// Which end of the order a limit is pinned to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anchor {
    /// `limitToFirst`: the view starts at the left of the order.
    First,
    /// `limitToLast`: the view starts at the right of the order.
    Last,
}

/// A result-count cap pinned to one end of the order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Limit {
    pub count: usize,
    pub anchor: Anchor,
}

/// Ordering, bounds and limit of a query.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct QueryParams {
    pub order_by: OrderBy,
    pub start_at: Option<BoundValue>,
    pub end_at: Option<BoundValue>,
    pub limit: Option<Limit>,
}

impl QueryParams {
    /// Whether the limit is pinned to one end of the order.
    pub fn has_anchored_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn limit_count(&self) -> Option<usize> {
        self.limit.map(|l| l.count)
    }

    pub fn has_start(&self) -> bool {
        self.start_at.is_some()
    }

    /// True unless the query is limited to the last N children.
    pub fn is_view_from_left(&self) -> bool {
        !matches!(
            self.limit,
            Some(Limit {
                anchor: Anchor::Last,
                ..
            })
        )
    }

    /// Iteration order of the cached view.
    ///
    /// "Last N" queries present newest first; everything else ascends.
    pub fn direction(&self) -> Direction {
        if self.is_view_from_left() {
            Direction::Ascending
        } else {
            Direction::Descending
        }
    }

    /// True if the query has no bounds and no limit.
    pub fn loads_all_data(&self) -> bool {
        self.start_at.is_none() && self.end_at.is_none() && self.limit.is_none()
    }
}

/// Opaque, comparable identity of a remote query.
///
/// Two requests with equal specs share one cache and one remote subscription.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuerySpec {
    pub path: String,
    pub params: QueryParams,
}

impl QuerySpec {
    /// A query over all children of `path`, ordered by key.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            params: QueryParams::default(),
        }
    }

    pub fn order_by_key(mut self) -> Self {
        self.params.order_by = OrderBy::Key;
        self
    }

    pub fn order_by_value(mut self) -> Self {
        self.params.order_by = OrderBy::Value;
        self
    }

    pub fn order_by_child(mut self, child: impl Into<String>) -> Self {
        self.params.order_by = OrderBy::Child(child.into());
        self
    }

    pub fn limit_to_first(mut self, count: usize) -> Self {
        self.params.limit = Some(Limit {
            count,
            anchor: Anchor::First,
        });
        self
    }

    pub fn limit_to_last(mut self, count: usize) -> Self {
        self.params.limit = Some(Limit {
            count,
            anchor: Anchor::Last,
        });
        self
    }

    pub fn start_at(mut self, value: BoundValue) -> Self {
        self.params.start_at = Some(value);
        self
    }

    pub fn end_at(mut self, value: BoundValue) -> Self {
        self.params.end_at = Some(value);
        self
    }

    /// Derive a query starting at the given sort key.
    pub fn start_at_key<K: Serialize + ?Sized>(&self, key: &K) -> Result<Self> {
        Ok(self.clone().start_at(BoundValue::from_key(key)?))
    }

    /// Derive a query ending at the given sort key.
    pub fn end_at_key<K: Serialize + ?Sized>(&self, key: &K) -> Result<Self> {
        Ok(self.clone().end_at(BoundValue::from_key(key)?))
    }

    /// Same bounds and ordering, without a limit.
    pub fn unlimited(&self) -> Self {
        let mut spec = self.clone();
        spec.params.limit = None;
        spec
    }
}

impl fmt::Display for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)?;
        let p = &self.params;
        match &p.order_by {
            OrderBy::Key => write!(f, "?orderBy=$key")?,
            OrderBy::Value => write!(f, "?orderBy=$value")?,
            OrderBy::Priority => write!(f, "?orderBy=$priority")?,
            OrderBy::Child(c) => write!(f, "?orderBy={}", c)?,
        }
        if let Some(ref s) = p.start_at {
            write!(f, "&startAt={}", s)?;
        }
        if let Some(ref e) = p.end_at {
            write!(f, "&endAt={}", e)?;
        }
        match p.limit {
            Some(Limit {
                count,
                anchor: Anchor::First,
            }) => write!(f, "&limitToFirst={}", count)?,
            Some(Limit {
                count,
                anchor: Anchor::Last,
            }) => write!(f, "&limitToLast={}", count)?,
            None => {}
        }
        Ok(())
    }
}

impl fmt::Debug for QuerySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QuerySpec({})", self)
    }
}

// --- Wire Data ---

/// A keyed snapshot of one child as delivered by the remote source.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub key: EntityId,
    pub value: serde_json::Value,
}

impl Snapshot {
    pub fn new(key: impl Into<EntityId>, value: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }

    /// Deserialize the snapshot payload.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }

    /// True if the snapshot carries no data (the child does not exist).
    pub fn is_null(&self) -> bool {
        self.value.is_null()
    }
}

/// Why the remote source stopped or refused a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteErrorCode {
    Cancelled,
    PermissionDenied,
    Disconnected,
    Other,
}

/// A delivery error reported by the remote source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code:?}: {message}")]
pub struct RemoteError {
    pub code: RemoteErrorCode,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: RemoteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::Cancelled, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(RemoteErrorCode::PermissionDenied, message)
    }
}

// --- Entities ---

/// A record retrieved from the remote source.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Stable identifier assigned by the remote source.
    fn entity_id(&self) -> &str;
}

/// Static, per-type decoding of wire snapshots.
pub trait FromWireSnapshot: Sized {
    fn from_snapshot(snapshot: &Snapshot) -> Result<Self>;
}

/// Unique identifier of a cache context.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeId(pub u64);

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

impl ScopeId {
    pub fn next() -> Self {
        ScopeId(NEXT_SCOPE_ID.fetch_add(1, AtomicOrdering::SeqCst))
    }
}

/// Non-owning handle to the scope and query an entity was loaded through.
///
/// Resolve it through [`crate::CacheContext::resolve`] to issue sub-queries.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheScope {
    pub scope: ScopeId,
    pub query: QuerySpec,
}

/// Entities that want to know which scope and query they were loaded through.
pub trait Scoped {
    fn attach_scope(&mut self, scope: &CacheScope);
}
