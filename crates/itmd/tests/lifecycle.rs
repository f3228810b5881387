//! Tunnel lifecycle driven by port, liveness and monitoring changes.

mod common;

use std::time::Duration;

use common::{ip, test_config, zone, TestSetup};
use itm_common::{Change, ChangeHandler};
use itmd::provisioner::ProvisionCommand;
use itmd::types::{
    DpnId, MonitoringConfig, OperStatus, Port, PortId, TunnelEndpoints, TunnelKind, TunnelName,
    VtepKey,
};
use itmd::TunnelState;
use pretty_assertions::assert_eq;

async fn single_tunnel(monitoring: Option<MonitoringConfig>) -> (TestSetup, itmd::types::Tunnel) {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1, 2]).await;
    let mut tz = zone("tz", TunnelKind::Vxlan, &[1, 2]);
    tz.monitoring = monitoring;
    setup.add_zone(tz).await;
    let tunnel = setup.tunnels("tz").await.remove(0);
    (setup, tunnel)
}

fn monitored() -> MonitoringConfig {
    MonitoringConfig {
        enabled: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_created_tunnel_starts_provisioning() {
    let (_setup, tunnel) = single_tunnel(None).await;
    assert_eq!(tunnel.state, TunnelState::Provisioning);
    assert_eq!(tunnel.oper_status, OperStatus::Unknown);
}

#[tokio::test]
async fn test_port_up_and_removal() {
    let (setup, tunnel) = single_tunnel(None).await;

    setup.tunnel_port_up(&tunnel, 11, true).await;
    let stored = setup.tunnel(&tunnel.name).await.unwrap();
    assert_eq!(stored.state, TunnelState::Up);
    assert_eq!(stored.if_index, Some(11));
    assert_eq!(
        setup.commands_named("set_oper_state"),
        vec![ProvisionCommand::SetOperState(
            tunnel.name.clone(),
            OperStatus::Up
        )]
    );

    let port = Port::new(PortId::new(tunnel.endpoints.src_dpn(), 11), tunnel.name.as_str());
    setup.port(Change::removed(port)).await;
    let stored = setup.tunnel(&tunnel.name).await.unwrap();
    assert_eq!(stored.state, TunnelState::Down);
    assert_eq!(stored.oper_status, OperStatus::Down);
}

#[tokio::test]
async fn test_port_with_invalid_index_keeps_provisioning() {
    let (setup, tunnel) = single_tunnel(None).await;
    setup.tunnel_port_up(&tunnel, 0, true).await;

    let stored = setup.tunnel(&tunnel.name).await.unwrap();
    assert_eq!(stored.state, TunnelState::Provisioning);
    assert!(setup.commands_named("set_oper_state").is_empty());
}

#[tokio::test]
async fn test_liveness_only_counts_when_monitored() {
    let (setup, tunnel) = single_tunnel(Some(monitored())).await;
    setup.tunnel_port_up(&tunnel, 3, true).await;
    assert_eq!(setup.tunnel(&tunnel.name).await.unwrap().state, TunnelState::Up);

    setup.liveness(&tunnel.name, false).await;
    assert_eq!(setup.tunnel(&tunnel.name).await.unwrap().state, TunnelState::Down);

    setup.liveness(&tunnel.name, true).await;
    assert_eq!(setup.tunnel(&tunnel.name).await.unwrap().state, TunnelState::Up);

    let (plain, tunnel) = single_tunnel(None).await;
    plain.tunnel_port_up(&tunnel, 3, true).await;
    plain.liveness(&tunnel.name, false).await;
    assert_eq!(plain.tunnel(&tunnel.name).await.unwrap().state, TunnelState::Up);
}

#[tokio::test]
async fn test_monitoring_toggle_retunes_without_reprovisioning() {
    let setup = TestSetup::new().await;
    setup.add_dpns(&[1, 2]).await;
    let on = zone("tz", TunnelKind::Vxlan, &[1, 2]).with_monitoring(monitored());
    setup.add_zone(on.clone()).await;
    let tunnel = setup.tunnels("tz").await.remove(0);
    setup.tunnel_port_up(&tunnel, 3, true).await;
    setup.liveness(&tunnel.name, false).await;
    assert_eq!(setup.tunnel(&tunnel.name).await.unwrap().state, TunnelState::Down);

    let off_params = MonitoringConfig {
        enabled: false,
        ..monitored()
    };
    let off = zone("tz", TunnelKind::Vxlan, &[1, 2]).with_monitoring(off_params);
    setup.update_zone(on, off).await;

    let stored = setup.tunnel(&tunnel.name).await.unwrap();
    assert_eq!(stored.name, tunnel.name);
    assert_eq!(stored.state, TunnelState::Up);
    assert!(!stored.monitoring.enabled);
    assert_eq!(stored.liveness, None);
    assert_eq!(setup.created_count(), 1);
    assert!(setup.provisioner.removed().is_empty());
    assert_eq!(
        setup.commands_named("toggle_monitoring"),
        vec![ProvisionCommand::ToggleMonitoring("tz".into(), off_params)]
    );
}

#[tokio::test]
async fn test_event_for_unknown_tunnel_is_ignored() {
    let setup = TestSetup::new().await;
    let name = TunnelName::from_raw("tun0123456789ab");
    setup.liveness(&name, false).await;

    assert!(setup.tunnel(&name).await.is_none());
    assert!(setup.provisioner.commands().is_empty());
    assert_eq!(setup.ctx().metrics.jobs_failed(), 0);
}

#[tokio::test]
async fn test_removed_tunnel_ignores_late_port_event() {
    let (setup, tunnel) = single_tunnel(None).await;
    setup
        .update_zone(
            zone("tz", TunnelKind::Vxlan, &[1, 2]),
            zone("tz", TunnelKind::Vxlan, &[1]),
        )
        .await;
    assert!(setup.tunnel(&tunnel.name).await.is_none());

    setup.tunnel_port_up(&tunnel, 3, true).await;
    assert!(setup.tunnel(&tunnel.name).await.is_none());
    assert!(setup.commands_named("set_oper_state").is_empty());
}

#[tokio::test]
async fn test_port_reported_before_tunnel_exists() {
    let setup = TestSetup::new().await;
    let endpoints = TunnelEndpoints::internal(
        VtepKey::new("tz", DpnId(1), ip("10.0.0.1")),
        VtepKey::new("tz", DpnId(2), ip("10.0.0.2")),
    );
    let name = TunnelName::derive(&endpoints, TunnelKind::Vxlan);
    setup
        .port(Change::added(Port::new(PortId::new(DpnId(1), 11), name.as_str())))
        .await;
    assert!(setup.tunnel(&name).await.is_none());

    setup.add_dpns(&[1, 2]).await;
    setup.add_zone(zone("tz", TunnelKind::Vxlan, &[1, 2])).await;

    let stored = setup.tunnel(&name).await.unwrap();
    assert_eq!(stored.state, TunnelState::Up);
    assert_eq!(stored.if_index, Some(11));
    assert_eq!(
        setup.commands_named("set_oper_state"),
        vec![ProvisionCommand::SetOperState(name, OperStatus::Up)]
    );
}

#[tokio::test]
async fn test_port_during_failed_tunnel_commit_is_not_lost() {
    let mut config = test_config();
    config.coordinator.retry_backoff_ms = 300;
    let setup = TestSetup::with_config(config).await;
    setup.add_dpns(&[1, 2]).await;
    setup.store.set_latency(Duration::from_millis(150));

    let listeners = setup.daemon.listeners();
    listeners
        .zones
        .on_change(Change::added(zone("tz", TunnelKind::Vxlan, &[1, 2])))
        .unwrap();
    let created = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(cmd) = setup.provisioner.created().first().cloned() {
                return cmd;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();

    // The row commit fails and is retried after the port arrives.
    setup.store.fail_next_commits(1);
    listeners
        .ports
        .on_change(Change::added(Port::new(
            PortId::new(created.src_dpn, 11),
            created.name.as_str(),
        )))
        .unwrap();
    setup.settle().await;

    let stored = setup.tunnel(&created.name).await.unwrap();
    assert_eq!(stored.state, TunnelState::Up);
    assert_eq!(stored.if_index, Some(11));
}

#[tokio::test]
async fn test_replayed_tunnel_port_is_idempotent() {
    let (once, tunnel) = single_tunnel(None).await;
    once.tunnel_port_up(&tunnel, 5, true).await;

    let (twice, tunnel) = single_tunnel(None).await;
    twice.tunnel_port_up(&tunnel, 5, true).await;
    twice.tunnel_port_up(&tunnel, 5, true).await;

    assert_eq!(twice.tunnels("tz").await, once.tunnels("tz").await);
    assert_eq!(twice.commands_named("set_oper_state").len(), 1);
}
