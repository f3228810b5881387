//! VM-migration guard.
//!
//! When an interface reappears on another DPN, the delete of its old port
//! can arrive after the add of the new one. The guard remembers the old
//! port until the unbind job for it has finished (or the guard times out),
//! and remove notifications for that port are dropped meanwhile.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::coordinator::JobTicket;
use crate::types::PortId;

/// An in-flight migration of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationEntry {
    pub old_port: PortId,
    pub new_port: PortId,
    pub generation: u64,
    pub started_at: DateTime<Utc>,
}

/// Migrations in flight, keyed by interface name.
#[derive(Debug, Default)]
pub struct MigrationGuard {
    entries: DashMap<String, MigrationEntry>,
    next_generation: AtomicU64,
}

impl MigrationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a migration of `name` and returns its generation.
    ///
    /// A newer migration of the same interface replaces the older entry.
    pub fn register(&self, name: &str, old_port: PortId, new_port: PortId) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.entries.insert(
            name.to_string(),
            MigrationEntry {
                old_port,
                new_port,
                generation,
                started_at: Utc::now(),
            },
        );
        generation
    }

    /// Returns true if a remove of `port` for `name` belongs to a migration
    /// still in flight.
    pub fn is_guarding_remove(&self, name: &str, port: PortId) -> bool {
        self.entries
            .get(name)
            .is_some_and(|entry| entry.old_port == port)
    }

    pub fn get(&self, name: &str) -> Option<MigrationEntry> {
        self.entries.get(name).map(|entry| entry.clone())
    }

    /// Clears the entry of `name` if it still has `generation`.
    pub fn clear(&self, name: &str, generation: u64) -> bool {
        self.entries
            .remove_if(name, |_, entry| entry.generation == generation)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clears the entry once the unbind job behind `ticket` resolves, or
    /// after `timeout`, whichever comes first.
    pub fn watch(
        self: &Arc<Self>,
        name: String,
        generation: u64,
        ticket: JobTicket,
        timeout: Duration,
    ) -> JoinHandle<()> {
        let guard = Arc::clone(self);
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, ticket.wait()).await {
                Ok(outcome) if outcome.is_success() => {
                    debug!(interface = %name, generation, "old binding released");
                }
                Ok(outcome) => {
                    warn!(interface = %name, generation, ?outcome, "unbind of old port did not complete");
                }
                Err(_) => {
                    warn!(
                        interface = %name,
                        generation,
                        timeout_ms = timeout.as_millis() as u64,
                        "migration guard timed out"
                    );
                }
            }
            guard.clear(&name, generation);
        })
    }
}
