//! Name-keyed in-memory index of one resource kind
//!
//! The store is split into a single [`StoreWriter`], owned by the dispatcher
//! that keeps it in lockstep with the cluster, and any number of cheap
//! [`Store`] readers handed to the components that consult it. Reads reflect
//! at least every write applied before the read began.

use std::sync::Arc;

use dashmap::DashMap;
use kube::ResourceExt;

/// Read handle onto a resource index
pub struct Store<K> {
    inner: Arc<DashMap<String, K>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> std::fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("size", &self.inner.len())
            .finish()
    }
}

impl<K: Clone> Store<K> {
    /// Look up a resource by name
    pub fn get(&self, name: &str) -> Option<K> {
        self.inner.get(name).map(|entry| entry.value().clone())
    }

    /// Whether a resource with this name is present
    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    /// All resources matching `predicate`
    pub fn filter<F>(&self, predicate: F) -> Vec<K>
    where
        F: Fn(&K) -> bool,
    {
        self.inner
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Snapshot of every resource
    pub fn values(&self) -> Vec<K> {
        self.filter(|_| true)
    }

    /// Names of every resource
    pub fn names(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of resources
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the store holds no resources
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<K: Clone + ResourceExt> Store<K> {
    /// All resources carrying label `key=value`
    pub fn with_label(&self, key: &str, value: &str) -> Vec<K> {
        self.filter(|k| k.labels().get(key).map(String::as_str) == Some(value))
    }

    /// Number of resources carrying label `key=value`
    pub fn count_with_label(&self, key: &str, value: &str) -> usize {
        self.inner
            .iter()
            .filter(|entry| entry.value().labels().get(key).map(String::as_str) == Some(value))
            .count()
    }
}

/// Exclusive write handle onto a resource index
///
/// Not `Clone`: each index has exactly one writer.
pub struct StoreWriter<K> {
    inner: Arc<DashMap<String, K>>,
}

impl<K> Default for StoreWriter<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> StoreWriter<K> {
    /// Create an empty index
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// A read handle onto this index
    pub fn reader(&self) -> Store<K> {
        Store {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Insert or replace a resource, returning the prior snapshot if any
    pub fn put(&mut self, name: impl Into<String>, resource: K) -> Option<K> {
        self.inner.insert(name.into(), resource)
    }

    /// Remove a resource, returning it if it was present
    pub fn remove(&mut self, name: &str) -> Option<K> {
        self.inner.remove(name).map(|(_, resource)| resource)
    }
}
