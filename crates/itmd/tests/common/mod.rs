//! Shared fixtures for itmd integration tests.
//!
//! Listeners are driven directly (no streams) and `settle` waits for the
//! coordinator to drain, so each step observes a converged engine.

#![allow(dead_code)]

use std::net::IpAddr;
use std::sync::Arc;

use itm_common::{Change, ChangeHandler};
use itmd::mesh::NotHostedZone;
use itmd::tables::{external_ids, Table};
use itmd::types::{
    DcGateway, DpnId, HostedVtep, MonitorEvent, Node, Port, PortId, TransportZone, Tunnel,
    TunnelKind, TunnelName, Vtep,
};
use itmd::{InMemoryStore, ItmConfig, ItmContext, ItmDaemon, ProvisionCommand, RecordingProvisioner};

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Configuration with fast timeouts and no default zone.
pub fn test_config() -> ItmConfig {
    let mut config = ItmConfig::default();
    config.default_zone.enabled = false;
    config.coordinator.task_timeout_ms = 2000;
    config.coordinator.retry_backoff_ms = 0;
    config.store.op_timeout_ms = 500;
    config.migration.guard_timeout_ms = 2000;
    config
}

/// A zone whose member on DPN `n` has IP `10.0.0.n`.
pub fn zone(name: &str, kind: TunnelKind, dpns: &[u64]) -> TransportZone {
    dpns.iter().fold(TransportZone::new(name, kind), |zone, &dpn| {
        zone.with_vtep(vtep(dpn))
    })
}

pub fn vtep(dpn: u64) -> Vtep {
    Vtep::new(DpnId(dpn), ip(&format!("10.0.0.{}", dpn))).with_port_name("eth1")
}

pub fn bridge(dpn: u64) -> Node {
    Node::new(format!("ovsdb://dpn{}/bridge/br-int", dpn), DpnId(dpn), "br-int")
}

pub struct TestSetup {
    pub daemon: ItmDaemon,
    pub store: Arc<InMemoryStore>,
    pub provisioner: Arc<RecordingProvisioner>,
}

impl TestSetup {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: ItmConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryStore::new())).await
    }

    /// Builds an engine over an existing store, as after a restart.
    pub async fn with_store(config: ItmConfig, store: Arc<InMemoryStore>) -> Self {
        let provisioner = Arc::new(RecordingProvisioner::new());
        let ctx = ItmContext::new(config, store.clone(), provisioner.clone()).unwrap();
        let daemon = ItmDaemon::new(ctx);
        daemon.bootstrap().await.unwrap();
        Self {
            daemon,
            store,
            provisioner,
        }
    }

    pub fn ctx(&self) -> &Arc<ItmContext> {
        self.daemon.context()
    }

    pub async fn settle(&self) {
        self.daemon.wait_idle().await;
    }

    pub async fn add_zone(&self, zone: TransportZone) {
        self.daemon
            .listeners()
            .zones
            .on_change(Change::added(zone))
            .unwrap();
        self.settle().await;
    }

    pub async fn update_zone(&self, old: TransportZone, new: TransportZone) {
        self.daemon
            .listeners()
            .zones
            .on_change(Change::modified(old, new))
            .unwrap();
        self.settle().await;
    }

    pub async fn remove_zone(&self, zone: TransportZone) {
        self.daemon
            .listeners()
            .zones
            .on_change(Change::removed(zone))
            .unwrap();
        self.settle().await;
    }

    pub async fn node(&self, change: Change<Node>) {
        self.daemon.listeners().nodes.on_change(change).unwrap();
        self.settle().await;
    }

    pub async fn add_dpns(&self, dpns: &[u64]) {
        for &dpn in dpns {
            self.daemon
                .listeners()
                .nodes
                .on_change(Change::added(bridge(dpn)))
                .unwrap();
        }
        self.settle().await;
    }

    pub async fn add_southbound(&self, dpn: u64, tep_ip: &str, zone: Option<&str>) {
        let mut node = bridge(dpn).with_external_id(external_ids::TEP_IP, tep_ip);
        if let Some(zone) = zone {
            node = node.with_external_id(external_ids::TZ_NAME, zone);
        }
        self.node(Change::added(node)).await;
    }

    pub async fn gateway(&self, change: Change<DcGateway>) {
        self.daemon.listeners().gateways.on_change(change).unwrap();
        self.settle().await;
    }

    pub async fn port(&self, change: Change<Port>) {
        self.daemon.listeners().ports.on_change(change).unwrap();
        self.settle().await;
    }

    /// Reports the dataplane port of `tunnel` on its source DPN.
    pub async fn tunnel_port_up(&self, tunnel: &Tunnel, port_no: u32, oper_up: bool) {
        let port = Port::new(
            PortId::new(tunnel.endpoints.src_dpn(), port_no),
            tunnel.name.as_str(),
        )
        .with_oper_up(oper_up);
        self.port(Change::added(port)).await;
    }

    pub async fn liveness(&self, tunnel: &TunnelName, alive: bool) {
        self.daemon
            .listeners()
            .monitor
            .on_change(Change::added(MonitorEvent {
                tunnel: tunnel.clone(),
                alive,
            }))
            .unwrap();
        self.settle().await;
    }

    pub async fn tunnels(&self, zone: &str) -> Vec<Tunnel> {
        let rows: Vec<(String, Tunnel)> = self.ctx().store.list(Table::Tunnel).await.unwrap();
        rows.into_iter()
            .map(|(_, t)| t)
            .filter(|t| t.zone.as_deref() == Some(zone))
            .collect()
    }

    pub async fn tunnel(&self, name: &TunnelName) -> Option<Tunnel> {
        self.ctx()
            .store
            .get(Table::Tunnel, name.as_str())
            .await
            .unwrap()
    }

    pub async fn hosted(&self, zone: &str) -> Vec<HostedVtep> {
        let rows: Vec<(String, HostedVtep)> = self.ctx().store.list(Table::Vtep).await.unwrap();
        rows.into_iter()
            .map(|(_, v)| v)
            .filter(|v| v.key.zone == zone)
            .collect()
    }

    pub async fn not_hosted(&self, zone: &str) -> Option<NotHostedZone> {
        self.ctx().store.get(Table::NotHosted, zone).await.unwrap()
    }

    pub fn created_count(&self) -> usize {
        self.provisioner.created().len()
    }

    pub fn commands_named(&self, name: &str) -> Vec<ProvisionCommand> {
        self.provisioner
            .commands()
            .into_iter()
            .filter(|c| c.name() == name)
            .collect()
    }
}
