//! Change listeners, one per notification stream.
//!
//! Each listener updates its cache synchronously and hands the rest to a
//! job, so a job enqueued afterwards always observes the update.

mod gateway;
mod monitor;
mod node;
mod port;
mod zone;

use std::sync::Arc;

pub use gateway::GatewayListener;
pub use monitor::MonitorListener;
pub use node::NodeListener;
pub use port::PortListener;
pub use zone::ZoneListener;

use crate::context::ItmContext;
use crate::lifecycle::LifecycleManager;
use crate::mesh::MeshReconciler;

/// The full set of listeners wired to one engine.
#[derive(Debug, Clone)]
pub struct Listeners {
    pub zones: Arc<ZoneListener>,
    pub gateways: Arc<GatewayListener>,
    pub nodes: Arc<NodeListener>,
    pub ports: Arc<PortListener>,
    pub monitor: Arc<MonitorListener>,
}

impl Listeners {
    pub fn new(
        ctx: &Arc<ItmContext>,
        mesh: &Arc<MeshReconciler>,
        lifecycle: &Arc<LifecycleManager>,
    ) -> Self {
        Self {
            zones: Arc::new(ZoneListener::new(Arc::clone(ctx), Arc::clone(mesh))),
            gateways: Arc::new(GatewayListener::new(Arc::clone(ctx), Arc::clone(mesh))),
            nodes: Arc::new(NodeListener::new(Arc::clone(ctx), Arc::clone(mesh))),
            ports: Arc::new(PortListener::new(Arc::clone(lifecycle))),
            monitor: Arc::new(MonitorListener::new(Arc::clone(lifecycle))),
        }
    }
}
