use std::collections::BTreeSet;
use std::sync::Arc;

use itm_common::{Change, ChangeHandler, TaskResult};
use tracing::{debug, info, warn};

use crate::cache::DpnInfo;
use crate::context::ItmContext;
use crate::error::ItmResult;
use crate::mesh::MeshReconciler;
use crate::types::{DpnId, Node, VtepKey};

/// Handles southbound bridge discovery.
///
/// A DPN is hosted while exactly one live bridge reports it. A disconnect
/// only flips the connection flag; the DPN is released when its bridge is
/// deleted.
#[derive(Debug)]
pub struct NodeListener {
    ctx: Arc<ItmContext>,
    mesh: Arc<MeshReconciler>,
}

impl NodeListener {
    pub fn new(ctx: Arc<ItmContext>, mesh: Arc<MeshReconciler>) -> Self {
        Self { ctx, mesh }
    }

    fn southbound_vtep(&self, dpn: DpnId, node: &Node) -> Option<VtepKey> {
        let ip = node.tep_ip()?;
        let zone = node
            .tz_name()
            .unwrap_or_else(|| self.ctx.default_zone_name());
        Some(VtepKey::new(zone, dpn, ip))
    }

    fn node_present(&self, node: &Node) -> ItmResult<()> {
        let Some(dpn) = node.dpn_id else {
            debug!(node = %node.node_id, "bridge without datapath id ignored");
            return Ok(());
        };

        if !node.is_dpn_bridge() {
            debug!(node = %node.node_id, bridge = %node.bridge_name, "not the datapath bridge, ignored");
            return self.release(dpn, &node.node_id);
        }

        let southbound = self.southbound_vtep(dpn, node);
        let info = DpnInfo::from_node(dpn, node, southbound.clone());
        if self.ctx.caches.dpns.put_if_absent(dpn, info.clone()) {
            info!(dpn = %dpn, node = %node.node_id, connected = node.connected, "DPN hosted");
            let zones = southbound.into_iter().map(|key| key.zone).collect();
            self.mesh.schedule_dpn_hosted(dpn, zones)?;
            return Ok(());
        }

        if let Some(current) = self.ctx.caches.dpns.get(&dpn) {
            if current.node_id != node.node_id {
                warn!(
                    dpn = %dpn,
                    existing = %current.node_id,
                    node = %node.node_id,
                    "DPN already reported by another bridge, ignored"
                );
                return Ok(());
            }
        }

        match self.ctx.caches.dpns.put(dpn, info) {
            None => {
                let zones = southbound.into_iter().map(|key| key.zone).collect();
                self.mesh.schedule_dpn_hosted(dpn, zones)?;
            }
            Some(prev) if prev.southbound_vtep != southbound => {
                info!(
                    dpn = %dpn,
                    from = ?prev.southbound_vtep,
                    to = ?southbound,
                    "southbound VTEP changed"
                );
                let zones: BTreeSet<String> = prev
                    .southbound_vtep
                    .iter()
                    .chain(southbound.iter())
                    .map(|key| key.zone.clone())
                    .collect();
                self.mesh.schedule_dpn_hosted(dpn, zones)?;
            }
            Some(prev) if prev.connected != node.connected => {
                info!(dpn = %dpn, connected = node.connected, "DPN connection state changed");
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Releases `dpn` if `node_id` is its live bridge.
    ///
    /// Another datapath bridge still reporting `dpn` then hosts it.
    fn release(&self, dpn: DpnId, node_id: &str) -> ItmResult<()> {
        let live = self
            .ctx
            .caches
            .dpns
            .get(&dpn)
            .is_some_and(|info| info.node_id == node_id);
        if !live {
            return Ok(());
        }

        if let Some(info) = self.ctx.caches.dpns.remove(&dpn) {
            info!(dpn = %dpn, node = node_id, "DPN removed");
            self.mesh.schedule_dpn_removed(info.as_ref().clone())?;
        }

        let successor = self
            .ctx
            .caches
            .nodes
            .values()
            .into_iter()
            .find(|n| n.dpn_id == Some(dpn) && n.node_id != node_id && n.is_dpn_bridge());
        if let Some(node) = successor {
            info!(dpn = %dpn, node = %node.node_id, "bridge takes over DPN");
            self.node_present(&node)?;
        }
        Ok(())
    }
}

impl ChangeHandler<Node> for NodeListener {
    fn name(&self) -> &str {
        "node"
    }

    fn on_change(&self, change: Change<Node>) -> TaskResult<()> {
        let kind = self
            .ctx
            .caches
            .nodes
            .apply_change(&change, |node| node.node_id.clone())?;
        debug!(kind = %kind, node = ?change.latest().map(|n| &n.node_id), "bridge changed");

        // A bridge that switched datapath ids gives up the old one first.
        if let Some(old) = &change.old {
            let moved = change
                .new
                .as_ref()
                .map_or(true, |new| new.dpn_id != old.dpn_id || new.node_id != old.node_id);
            if let (true, Some(dpn)) = (moved, old.dpn_id) {
                self.release(dpn, &old.node_id)?;
            }
        }
        if let Some(new) = &change.new {
            self.node_present(new)?;
        }
        Ok(())
    }
}
