use std::sync::Arc;

use itm_common::{Change, ChangeHandler, TaskResult};
use tracing::debug;

use crate::context::ItmContext;
use crate::mesh::MeshReconciler;
use crate::types::DcGateway;

/// Handles DC gateway configuration changes.
#[derive(Debug)]
pub struct GatewayListener {
    ctx: Arc<ItmContext>,
    mesh: Arc<MeshReconciler>,
}

impl GatewayListener {
    pub fn new(ctx: Arc<ItmContext>, mesh: Arc<MeshReconciler>) -> Self {
        Self { ctx, mesh }
    }
}

impl ChangeHandler<DcGateway> for GatewayListener {
    fn name(&self) -> &str {
        "gateway"
    }

    fn on_change(&self, change: Change<DcGateway>) -> TaskResult<()> {
        let kind = self.ctx.caches.gateways.apply_change(&change, |gw| gw.ip)?;
        debug!(kind = %kind, gateway = ?change.latest().map(|gw| gw.ip), "DC gateway changed");
        self.mesh.schedule_gateway(change)?;
        Ok(())
    }
}
