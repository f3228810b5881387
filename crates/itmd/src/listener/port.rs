use std::sync::Arc;

use itm_common::{Change, ChangeHandler, TaskResult};
use tracing::debug;

use crate::lifecycle::LifecycleManager;
use crate::types::{Port, PortReason, TunnelName};

/// Handles dataplane port notifications.
///
/// Ports named like tunnels drive the tunnel lifecycle; every other port is
/// a VM interface.
#[derive(Debug)]
pub struct PortListener {
    lifecycle: Arc<LifecycleManager>,
}

impl PortListener {
    pub fn new(lifecycle: Arc<LifecycleManager>) -> Self {
        Self { lifecycle }
    }
}

/// Folds an update carrying a delete reason into a removal.
fn normalize(change: Change<Port>) -> Change<Port> {
    match change {
        Change { new: Some(port), .. } if port.reason == PortReason::Delete => Change::removed(port),
        other => other,
    }
}

impl ChangeHandler<Port> for PortListener {
    fn name(&self) -> &str {
        "port"
    }

    fn on_change(&self, change: Change<Port>) -> TaskResult<()> {
        let kind = change.kind()?;
        let change = normalize(change);
        let Some(port) = change.latest() else {
            return Ok(());
        };
        debug!(kind = %kind, port = %port.id, name = %port.name, "port changed");

        if TunnelName::is_tunnel_name(&port.name) {
            self.lifecycle.on_tunnel_port(&change)?;
        } else {
            self.lifecycle.on_interface_port(&change)?;
        }
        Ok(())
    }
}
