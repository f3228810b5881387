//! Parked entries waiting on unmet dependencies.
//!
//! An entry that cannot be processed yet (for example an endpoint whose
//! hosting node has not been discovered) is parked together with the
//! dependencies it waits on. The owner decides when an entry is promoted;
//! the set only answers who waits on what and for how long.
//!
//! A `ParkedSet` is plain data: it is serialisable so it can live in a store
//! record and be mutated by whichever task owns that record.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A dependency on an entity identified by table and key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Dependency {
    /// The table containing the dependency
    pub table: String,
    /// The key within the table
    pub key: String,
}

impl Dependency {
    /// Creates a new dependency.
    pub fn new(table: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            key: key.into(),
        }
    }
}

impl std::fmt::Display for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.table, self.key)
    }
}

/// A parked entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkedEntry<T> {
    /// The parked data
    pub data: T,
    /// Dependencies the entry waits on
    pub waiting_on: BTreeSet<Dependency>,
    /// When the entry was first parked
    pub parked_at: DateTime<Utc>,
}

/// Entries keyed by a string identity, each waiting on dependencies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "T: Serialize",
    deserialize = "T: serde::de::DeserializeOwned"
))]
pub struct ParkedSet<T> {
    entries: BTreeMap<String, ParkedEntry<T>>,
}

impl<T> ParkedSet<T> {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Returns the number of parked entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is parked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parks an entry, replacing any entry with the same key.
    ///
    /// The original `parked_at` is kept when an entry is re-parked so that
    /// replayed notifications do not extend its lifetime.
    pub fn park(
        &mut self,
        key: impl Into<String>,
        data: T,
        waiting_on: impl IntoIterator<Item = Dependency>,
        now: DateTime<Utc>,
    ) {
        let key = key.into();
        let parked_at = self
            .entries
            .get(&key)
            .map(|e| e.parked_at)
            .unwrap_or(now);
        self.entries.insert(
            key,
            ParkedEntry {
                data,
                waiting_on: waiting_on.into_iter().collect(),
                parked_at,
            },
        );
    }

    /// Removes an entry.
    pub fn remove(&mut self, key: &str) -> Option<T> {
        self.entries.remove(key).map(|e| e.data)
    }

    /// Iterates over all entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParkedEntry<T>)> {
        self.entries.iter()
    }

    /// Returns true if any entry waits on the dependency.
    pub fn is_waiting_on(&self, dependency: &Dependency) -> bool {
        self.entries
            .values()
            .any(|e| e.waiting_on.contains(dependency))
    }

    /// Removes and returns every entry parked before `cutoff`.
    pub fn expire(&mut self, cutoff: DateTime<Utc>) -> Vec<(String, T)> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.parked_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect();

        stale
            .into_iter()
            .filter_map(|k| self.entries.remove(&k).map(|e| (k, e.data)))
            .collect()
    }
}

impl<T> Default for ParkedSet<T> {
    fn default() -> Self {
        Self::new()
    }
}
