//! Uid-keyed registry.
//!
//! Registries are shared between the configuration loader, translator threads,
//! run workers and API callers, so every operation is atomic with respect to the
//! others. The map is a `DashMap`; registration goes through the entry API so
//! "register if absent" is a single check-and-set.

use crate::error::{BenchError, BenchResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Thread-safe mapping from string uid to `T`.
///
/// Items are returned by clone, so `T` is typically an `Arc<..>` or a plain
/// function pointer.
pub struct Registry<T> {
    kind: &'static str,
    items: DashMap<String, T>,
}

impl<T> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("len", &self.items.len())
            .finish()
    }
}

impl<T: Clone> Registry<T> {
    /// Create an empty registry. `kind` names the items in error messages.
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: DashMap::new(),
        }
    }

    /// What this registry holds.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// Register `item` under `uid`. Fails with `Duplicate` if the uid is taken.
    pub fn register(&self, uid: impl Into<String>, item: T) -> BenchResult<()> {
        match self.items.entry(uid.into()) {
            Entry::Occupied(entry) => Err(BenchError::Duplicate {
                kind: self.kind,
                uid: entry.key().clone(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(item);
                Ok(())
            }
        }
    }

    /// Look up `uid`. Fails with `NotFound` if absent.
    pub fn get(&self, uid: &str) -> BenchResult<T> {
        self.items
            .get(uid)
            .map(|item| item.value().clone())
            .ok_or_else(|| BenchError::not_found(self.kind, uid))
    }

    /// Remove `uid`, returning the item. Fails with `NotFound` if absent.
    pub fn unregister(&self, uid: &str) -> BenchResult<T> {
        self.items
            .remove(uid)
            .map(|(_, item)| item)
            .ok_or_else(|| BenchError::not_found(self.kind, uid))
    }

    /// Whether `uid` is registered.
    pub fn contains(&self, uid: &str) -> bool {
        self.items.contains_key(uid)
    }

    /// All registered uids, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.items.iter().map(|item| item.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of all registered items.
    pub fn values(&self) -> Vec<T> {
        self.items.iter().map(|item| item.value().clone()).collect()
    }

    /// Number of registered items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Remove every item.
    pub fn clear(&self) {
        self.items.clear();
    }
}
