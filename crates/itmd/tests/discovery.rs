//! Southbound discovery: DPN hosting, disconnects and southbound VTEPs.

mod common;

use common::{bridge, test_config, zone, TestSetup};
use itm_common::Change;
use itmd::tables::{external_ids, Table};
use itmd::types::{DpnId, Node, TunnelKind, VtepOrigin};
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_disconnect_keeps_tunnels_removal_tears_down() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1, 2, 3]).await;
    setup.add_zone(zone("tz", TunnelKind::Vxlan, &[1, 2, 3])).await;

    let mut disconnected = bridge(1);
    disconnected.connected = false;
    setup.node(Change::modified(bridge(1), disconnected.clone())).await;

    assert!(setup.ctx().caches.is_dpn_hosted(DpnId(1)));
    assert!(!setup.ctx().caches.dpns.get(&DpnId(1)).unwrap().connected);
    assert_eq!(setup.tunnels("tz").await.len(), 3);
    assert!(setup.provisioner.removed().is_empty());

    setup.node(Change::removed(disconnected)).await;

    assert!(!setup.ctx().caches.is_dpn_hosted(DpnId(1)));
    let tunnels = setup.tunnels("tz").await;
    assert_eq!(tunnels.len(), 1);
    assert!(tunnels
        .iter()
        .all(|t| !t.endpoints.dpns().contains(&DpnId(1))));
    assert_eq!(setup.provisioner.removed().len(), 2);

    // The member waits for its DPN to come back.
    let parked = setup.not_hosted("tz").await.unwrap();
    assert!(parked.waits_on_dpn(DpnId(1)));
    assert!(setup
        .ctx()
        .store
        .keys_with_prefix(Table::DpnTunnel, "1|")
        .await
        .unwrap()
        .is_empty());

    setup.add_dpns(&[1]).await;
    assert_eq!(setup.tunnels("tz").await.len(), 3);
}

#[tokio::test]
async fn test_second_bridge_for_same_dpn_is_ignored() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1, 2]).await;
    setup.add_zone(zone("tz", TunnelKind::Vxlan, &[1, 2])).await;

    let impostor = Node::new("ovsdb://other/bridge/br-int", DpnId(1), "br-int");
    setup.node(Change::added(impostor.clone())).await;
    assert_eq!(
        setup.ctx().caches.dpns.get(&DpnId(1)).unwrap().node_id,
        bridge(1).node_id
    );

    // Removing the ignored bridge does not release the DPN.
    setup.node(Change::removed(impostor)).await;
    assert!(setup.ctx().caches.is_dpn_hosted(DpnId(1)));
    assert_eq!(setup.tunnels("tz").await.len(), 1);
}

#[tokio::test]
async fn test_second_bridge_takes_over_when_first_is_deleted() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1, 2]).await;
    setup.add_zone(zone("tz", TunnelKind::Vxlan, &[1, 2])).await;

    let standby = Node::new("ovsdb://other/bridge/br-int", DpnId(1), "br-int");
    setup.node(Change::added(standby.clone())).await;
    setup.node(Change::removed(bridge(1))).await;

    let info = setup.ctx().caches.dpns.get(&DpnId(1)).unwrap();
    assert_eq!(info.node_id, standby.node_id);
    assert_eq!(setup.tunnels("tz").await.len(), 1);
}

#[tokio::test]
async fn test_non_datapath_bridge_is_ignored() {
    let setup = TestSetup::new().await;
    let node = bridge(4).with_external_id(external_ids::DPN_BR_NAME, "br-phys");
    setup.node(Change::added(node)).await;

    assert!(!setup.ctx().caches.is_dpn_hosted(DpnId(4)));
    assert_eq!(setup.ctx().caches.nodes.len(), 1);
}

#[tokio::test]
async fn test_southbound_vtep_joins_configured_zone() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1]).await;
    setup.add_zone(zone("tz", TunnelKind::Vxlan, &[1])).await;

    setup.add_southbound(2, "192.168.56.102", Some("tz")).await;

    let hosted = setup.hosted("tz").await;
    assert_eq!(hosted.len(), 2);
    let southbound = hosted.iter().find(|v| v.key.dpn == DpnId(2)).unwrap();
    assert_eq!(southbound.origin, VtepOrigin::Southbound);
    assert_eq!(southbound.key.ip, common::ip("192.168.56.102"));
    assert_eq!(setup.tunnels("tz").await.len(), 1);
}

#[tokio::test]
async fn test_southbound_vtep_waits_for_its_zone() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1]).await;
    setup.add_southbound(2, "192.168.56.102", Some("late")).await;

    let parked = setup.not_hosted("late").await.unwrap();
    assert_eq!(parked.parked.len(), 1);
    assert!(setup.hosted("late").await.is_empty());

    setup.add_zone(zone("late", TunnelKind::Vxlan, &[1])).await;
    assert_eq!(setup.hosted("late").await.len(), 2);
    assert!(setup.not_hosted("late").await.is_none());
    assert_eq!(setup.tunnels("late").await.len(), 1);
}

#[tokio::test]
async fn test_southbound_vtep_moves_between_zones() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1]).await;
    setup.add_zone(zone("a", TunnelKind::Vxlan, &[1])).await;
    setup.add_zone(zone("b", TunnelKind::Vxlan, &[1])).await;

    let in_a = bridge(2)
        .with_external_id(external_ids::TEP_IP, "192.168.56.102")
        .with_external_id(external_ids::TZ_NAME, "a");
    setup.node(Change::added(in_a.clone())).await;
    assert_eq!(setup.tunnels("a").await.len(), 1);

    let in_b = in_a.clone().with_external_id(external_ids::TZ_NAME, "b");
    setup.node(Change::modified(in_a, in_b)).await;

    assert!(setup.tunnels("a").await.is_empty());
    assert_eq!(setup.hosted("a").await.len(), 1);
    assert_eq!(setup.tunnels("b").await.len(), 1);
}

#[tokio::test]
async fn test_default_zone_collects_untagged_southbound_vteps() {
    let mut config = test_config();
    config.default_zone.enabled = true;
    let zone_name = config.default_zone.name.clone();
    let setup = TestSetup::with_config(config).await;
    setup.settle().await;
    assert!(setup.ctx().caches.zones.contains_key(&zone_name));

    setup.add_southbound(1, "192.168.56.101", None).await;
    setup.add_southbound(2, "192.168.56.102", None).await;

    assert_eq!(setup.hosted(&zone_name).await.len(), 2);
    assert_eq!(setup.tunnels(&zone_name).await.len(), 1);
    assert_eq!(setup.store.table_len(Table::Zone), 1);
}
