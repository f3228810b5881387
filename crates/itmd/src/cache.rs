//! Derived-state caches.
//!
//! Every map is written only by listener callbacks and read by jobs. Values
//! are swapped whole, so a reader holding an `Arc` from `get` never sees a
//! half-applied update.

use std::net::IpAddr;

use itm_common::SnapshotMap;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ItmResult;
use crate::store::StoreClient;
use crate::tables::Table;
use crate::types::{
    DcGateway, DpnId, InterfaceBinding, Node, Port, TransportZone, TunnelName, VtepKey,
};

/// What the engine knows about a datapath.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DpnInfo {
    pub id: DpnId,
    /// Node id of the single live bridge reference
    pub node_id: String,
    pub bridge_name: String,
    pub connected: bool,
    /// VTEP declared through the bridge's external ids
    pub southbound_vtep: Option<VtepKey>,
}

impl DpnInfo {
    pub fn from_node(id: DpnId, node: &Node, southbound_vtep: Option<VtepKey>) -> Self {
        Self {
            id,
            node_id: node.node_id.clone(),
            bridge_name: node.bridge_name.clone(),
            connected: node.connected,
            southbound_vtep,
        }
    }
}

/// The cache set shared by listeners and jobs.
#[derive(Debug, Default)]
pub struct CacheSet {
    pub zones: SnapshotMap<String, TransportZone>,
    pub dpns: SnapshotMap<DpnId, DpnInfo>,
    pub nodes: SnapshotMap<String, Node>,
    pub interfaces: SnapshotMap<String, InterfaceBinding>,
    pub gateways: SnapshotMap<IpAddr, DcGateway>,
    /// Dataplane ports of tunnels, as last reported; may run ahead of the
    /// tunnel rows
    pub tunnel_ports: SnapshotMap<TunnelName, Port>,
}

impl CacheSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a live bridge currently reports `dpn`.
    pub fn is_dpn_hosted(&self, dpn: DpnId) -> bool {
        self.dpns.contains_key(&dpn)
    }

    /// Returns the hosting DPN last seen for an interface.
    pub fn interface_dpn(&self, name: &str) -> Option<DpnId> {
        self.interfaces.get(&name.to_string()).map(|b| b.dpn())
    }

    pub fn clear(&self) {
        self.zones.clear();
        self.dpns.clear();
        self.nodes.clear();
        self.interfaces.clear();
        self.gateways.clear();
        self.tunnel_ports.clear();
    }

    /// Clears every cache and repopulates the configuration caches from the
    /// store.
    ///
    /// Southbound caches (`dpns`, `nodes`, `tunnel_ports`) stay empty
    /// until discovery replays its current state.
    pub async fn rebuild(&self, store: &StoreClient) -> ItmResult<()> {
        self.clear();

        let zones: Vec<(String, TransportZone)> = store.list(Table::Zone).await?;
        for (name, zone) in zones {
            self.zones.put(name, zone);
        }

        let gateways: Vec<(String, DcGateway)> = store.list(Table::Gateway).await?;
        for (_, gateway) in gateways {
            self.gateways.put(gateway.ip, gateway);
        }

        let bindings: Vec<(String, InterfaceBinding)> = store.list(Table::InterfaceState).await?;
        for (name, binding) in bindings {
            self.interfaces.put(name, binding);
        }

        info!(
            zones = self.zones.len(),
            gateways = self.gateways.len(),
            interfaces = self.interfaces.len(),
            "caches rebuilt from store"
        );
        Ok(())
    }
}
