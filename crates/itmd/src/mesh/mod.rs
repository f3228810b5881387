//! Full-mesh reconciliation of transport zones.

pub mod not_hosted;
pub mod plan;
mod reconciler;

pub use not_hosted::{NotHostedZone, ParkedVtep};
pub use plan::{desired_tunnels, plan_membership, plan_tunnels, MembershipPlan, TunnelPlan};
pub use reconciler::{MeshReconciler, ZoneReport};
