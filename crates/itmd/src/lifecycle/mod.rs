//! Tunnel lifecycle: the per-tunnel state machine, event scheduling and the
//! VM-migration guard.

mod manager;
pub mod migration;
mod state;

pub use manager::{apply_event, LifecycleManager};
pub use migration::{MigrationEntry, MigrationGuard};
pub use state::{apply, LifecycleEvent, Transition, TunnelState};
