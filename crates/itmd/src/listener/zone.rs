use std::collections::BTreeSet;
use std::sync::Arc;

use itm_common::{Change, ChangeHandler, TaskResult};
use tracing::debug;

use crate::context::ItmContext;
use crate::mesh::MeshReconciler;
use crate::types::TransportZone;

/// Handles transport zone configuration changes.
#[derive(Debug)]
pub struct ZoneListener {
    ctx: Arc<ItmContext>,
    mesh: Arc<MeshReconciler>,
}

impl ZoneListener {
    pub fn new(ctx: Arc<ItmContext>, mesh: Arc<MeshReconciler>) -> Self {
        Self { ctx, mesh }
    }
}

impl ChangeHandler<TransportZone> for ZoneListener {
    fn name(&self) -> &str {
        "zone"
    }

    fn on_change(&self, change: Change<TransportZone>) -> TaskResult<()> {
        let kind = self
            .ctx
            .caches
            .zones
            .apply_change(&change, |zone| zone.name.clone())?;

        let names: BTreeSet<&str> = change
            .old
            .iter()
            .chain(change.new.iter())
            .map(|zone| zone.name.as_str())
            .collect();
        debug!(kind = %kind, zones = ?names, "transport zone changed");

        for name in names {
            self.mesh.schedule_zone(name)?;
        }
        Ok(())
    }
}
