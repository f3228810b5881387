//! Concurrent map with whole-value slot replacement.
//!
//! `SnapshotMap` is the building block of every derived cache. Values are
//! stored behind `Arc` and a write always swaps the complete slot, so a
//! reader holding the result of [`SnapshotMap::get`] keeps a consistent
//! version even while a writer publishes the next one. Values are never
//! mutated in place.
//!
//! Like a plain `SyncMap`, reads never create entries: [`SnapshotMap::get`]
//! returns `None` for a missing key and only the explicit write methods
//! insert.

use std::hash::Hash;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::change::{Change, ChangeKind};
use crate::task::TaskResult;

/// A concurrent map of `K -> Arc<V>` with atomic slot replacement.
#[derive(Debug)]
pub struct SnapshotMap<K, V>
where
    K: Eq + Hash,
{
    inner: DashMap<K, Arc<V>>,
}

impl<K, V> SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
{
    /// Creates a new empty map.
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Returns the number of entries in the map.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns true if the map contains the given key.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    /// Returns the current version for the key.
    ///
    /// **This never creates entries.**
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.inner.get(key).map(|slot| Arc::clone(slot.value()))
    }

    /// Publishes a new version, returning the replaced one.
    pub fn put(&self, key: K, value: V) -> Option<Arc<V>> {
        self.inner.insert(key, Arc::new(value))
    }

    /// Publishes a value only if the key is vacant.
    ///
    /// Returns true if the value was inserted.
    pub fn put_if_absent(&self, key: K, value: V) -> bool {
        match self.inner.entry(key) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Arc::new(value));
                true
            }
        }
    }

    /// Removes a key, returning the last published version.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.remove(key).map(|(_, value)| value)
    }

    /// Applies a classified change keyed by `key_of`.
    ///
    /// After this returns, `get` observes the new version (or absence for a
    /// removal). A modification that changes the key drops the old slot.
    pub fn apply_change<F>(&self, change: &Change<V>, key_of: F) -> TaskResult<ChangeKind>
    where
        V: Clone,
        F: Fn(&V) -> K,
    {
        let kind = change.kind()?;
        if let Some(old) = &change.old {
            let old_key = key_of(old);
            let moved = change.new.as_ref().map(|n| key_of(n) != old_key).unwrap_or(true);
            if moved {
                self.remove(&old_key);
            }
        }
        if let Some(new) = &change.new {
            self.put(key_of(new), new.clone());
        }
        Ok(kind)
    }

    /// Returns a point-in-time copy of every slot.
    pub fn snapshot(&self) -> Vec<(K, Arc<V>)> {
        self.inner
            .iter()
            .map(|slot| (slot.key().clone(), Arc::clone(slot.value())))
            .collect()
    }

    /// Returns every value currently published.
    pub fn values(&self) -> Vec<Arc<V>> {
        self.inner
            .iter()
            .map(|slot| Arc::clone(slot.value()))
            .collect()
    }

    /// Clears all entries from the map.
    pub fn clear(&self) {
        self.inner.clear();
    }
}

impl<K, V> Default for SnapshotMap<K, V>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
