//! Internal transport manager.
//!
//! Keeps a full mesh of overlay tunnels between the VTEPs of every
//! transport zone, plus tunnels from each VTEP to the zone's device VTEPs
//! and to the configured DC gateways.
//!
//! # Architecture
//!
//! ```text
//! change streams ──> listeners ──> caches (synchronous)
//!                             └──> JobCoordinator (per-key FIFO)
//!                                    ├── zone:<name>       MeshReconciler
//!                                    ├── dpn:<id>          zone fan-out
//!                                    ├── gateway:<ip>      zone fan-out
//!                                    ├── tunnel:<name>     lifecycle routing
//!                                    └── interface:<name>  VM bindings
//!                                          │
//!                                          ├──> ConfigStore (transactions)
//!                                          └──> TunnelProvisioner
//! ```
//!
//! Every write to a zone's membership and tunnel rows runs under that
//! zone's key, so a zone is always converged by one job at a time.

pub mod cache;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod daemon;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod mesh;
pub mod metrics;
pub mod provisioner;
pub mod store;
pub mod tables;
pub mod types;

pub use cache::{CacheSet, DpnInfo};
pub use config::ItmConfig;
pub use context::ItmContext;
pub use coordinator::{JobCoordinator, JobOutcome, JobTicket};
pub use daemon::{ChangeSinks, ItmDaemon};
pub use error::{ItmError, ItmResult};
pub use lifecycle::{LifecycleEvent, LifecycleManager, MigrationGuard, TunnelState};
pub use listener::Listeners;
pub use mesh::{MeshReconciler, ZoneReport};
pub use metrics::MetricsCollector;
pub use provisioner::{ProvisionCommand, RecordingProvisioner, TunnelProvisioner};
pub use store::{ConfigStore, InMemoryStore, StoreClient, Transaction};
