//! Common orchestration primitives for the internal transport manager.
//!
//! This crate provides the domain-independent building blocks used by the
//! tunnel mesh reconciliation engine:
//!
//! - [`Change`]: `{old?, new?}` notifications classified once into a [`ChangeKind`]
//! - [`SnapshotMap`]: concurrent map with whole-value slot replacement (cache primitive)
//! - [`TaskError`] / [`TaskStatus`]: task outcome taxonomy driving retry decisions
//! - [`ParkedSet`]: entries waiting on unmet [`Dependency`]s
//! - [`ChangeHandler`] / [`subscribe`]: one generic listener abstraction for every stream
//!
//! # Architecture
//!
//! ```text
//! notification ──> ChangeHandler::on_change ──> SnapshotMap (synchronous)
//!                                          └──> scheduler job (asynchronous)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use itm_common::{subscribe, change_stream, Change, ChangeHandler, TaskResult};
//!
//! struct ZoneListener { /* caches, coordinator */ }
//!
//! impl ChangeHandler<Zone> for ZoneListener {
//!     fn name(&self) -> &str { "zone" }
//!     fn on_change(&self, change: Change<Zone>) -> TaskResult<()> {
//!         // classify, update cache, enqueue job
//!         Ok(())
//!     }
//! }
//!
//! let (sink, stream) = change_stream(1024);
//! let task = subscribe(stream, Arc::new(ZoneListener { /* ... */ }));
//! ```

mod change;
mod handler;
mod park;
mod snapshot_map;
mod task;

pub use change::{Attributes, Change, ChangeKind, FieldValue};
pub use handler::{change_stream, subscribe, ChangeHandler, ChangeSink, ChangeStream, SubscriptionStats};
pub use park::{Dependency, ParkedEntry, ParkedSet};
pub use snapshot_map::SnapshotMap;
pub use task::{TaskError, TaskResult, TaskStatus};
