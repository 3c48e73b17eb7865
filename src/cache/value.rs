//! Single-value cache.

use crate::error::Result;
use crate::lifecycle::Scope;
use crate::observable::Observable;
use crate::remote::ValueEventListener;
use crate::types::{CacheScope, FromWireSnapshot, QuerySpec, RemoteError, Snapshot};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{trace, warn};

use super::collection::ItemInitializer;

/// One observable per query holding the latest decoded value of type `V`.
///
/// Entries are never evicted.
pub struct ValueCache<V> {
    scope: Arc<Scope>,
    initializer: Option<ItemInitializer<V>>,
    values: RwLock<HashMap<QuerySpec, Observable<Option<V>>>>,
}

impl<V> ValueCache<V>
where
    V: FromWireSnapshot + Clone + Send + Sync + 'static,
{
    pub fn new(scope: Arc<Scope>, initializer: Option<ItemInitializer<V>>) -> Self {
        Self {
            scope,
            initializer,
            values: RwLock::new(HashMap::new()),
        }
    }

    /// Observable for a query.
    ///
    /// The first request wires a value listener into the query's resource.
    pub fn observable(&self, query: &QuerySpec) -> Result<Observable<Option<V>>> {
        if let Some(existing) = self.values.read().get(query) {
            return Ok(existing.clone());
        }

        let (observable, created) = {
            let mut values = self.values.write();
            match values.get(query) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let observable = Observable::new();
                    values.insert(query.clone(), observable.clone());
                    (observable, true)
                }
            }
        };

        if created {
            let listener = Arc::new(ValueCacheListener {
                handle: self.scope.handle(query),
                observable: observable.clone(),
                initializer: self.initializer.clone(),
            });
            self.scope.resource(query).add_value_listener(listener)?;
        }
        Ok(observable)
    }

    /// Latest cached value for a query, if any.
    pub fn get(&self, query: &QuerySpec) -> Option<V> {
        self.values
            .read()
            .get(query)
            .and_then(|o| o.current())
            .and_then(|d| d.ok())
            .flatten()
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

struct ValueCacheListener<V> {
    handle: CacheScope,
    observable: Observable<Option<V>>,
    initializer: Option<ItemInitializer<V>>,
}

impl<V> ValueEventListener for ValueCacheListener<V>
where
    V: FromWireSnapshot + Clone + Send + Sync + 'static,
{
    fn on_data_change(&self, snapshot: &Snapshot) {
        if snapshot.is_null() {
            trace!(query = %self.handle.query, "Value absent");
            self.observable.post(None);
            return;
        }

        match V::from_snapshot(snapshot) {
            Ok(mut value) => {
                if let Some(ref init) = self.initializer {
                    init(&mut value, &self.handle);
                }
                self.observable.post(Some(value));
            }
            Err(e) => {
                warn!(query = %self.handle.query, key = %snapshot.key, error = %e, "Skipping undecodable value");
            }
        }
    }

    fn on_cancelled(&self, error: &RemoteError) {
        warn!(query = %self.handle.query, error = %error, "Value subscription cancelled");
        self.observable.post_error(error.clone());
    }
}
