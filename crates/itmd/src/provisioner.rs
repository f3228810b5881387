//! Outbound commands to the tunnel provisioning collaborator.

use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::error::{ItmError, ItmResult};
use crate::types::{
    DpnId, ExternalEndpoint, MonitoringConfig, OperStatus, PortId, Tunnel, TunnelEndpoints,
    TunnelKind, TunnelName,
};

/// Far end of a tunnel as seen by the provisioner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelRemote {
    Dpn { dpn: DpnId, ip: IpAddr },
    Gateway { ip: IpAddr },
    Device { node_id: String, ip: IpAddr },
}

/// Parameters of a `CreateTunnel` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateTunnel {
    pub name: TunnelName,
    pub src_dpn: DpnId,
    pub src_ip: IpAddr,
    pub remote: TunnelRemote,
    pub kind: TunnelKind,
    pub monitoring: MonitoringConfig,
    pub parent_interface: String,
}

impl From<&Tunnel> for CreateTunnel {
    fn from(tunnel: &Tunnel) -> Self {
        let (src_dpn, src_ip, remote) = match &tunnel.endpoints {
            TunnelEndpoints::Internal { src, dst } => (
                src.dpn,
                src.ip,
                TunnelRemote::Dpn {
                    dpn: dst.dpn,
                    ip: dst.ip,
                },
            ),
            TunnelEndpoints::External {
                dpn,
                src_ip,
                remote,
                ..
            } => {
                let remote = match remote {
                    ExternalEndpoint::DcGateway { ip } => TunnelRemote::Gateway { ip: *ip },
                    ExternalEndpoint::DeviceVtep { node_id, ip } => TunnelRemote::Device {
                        node_id: node_id.clone(),
                        ip: *ip,
                    },
                };
                (*dpn, *src_ip, remote)
            }
        };
        Self {
            name: tunnel.name.clone(),
            src_dpn,
            src_ip,
            remote,
            kind: tunnel.kind,
            monitoring: tunnel.monitoring,
            parent_interface: tunnel.parent_interface.clone(),
        }
    }
}

/// A command as recorded by [`RecordingProvisioner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionCommand {
    CreateTunnel(CreateTunnel),
    RemoveTunnel(TunnelName),
    SetOperState(TunnelName, OperStatus),
    ToggleMonitoring(String, MonitoringConfig),
    BindInterface(String, PortId),
    UnbindInterface(String, PortId),
}

impl ProvisionCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ProvisionCommand::CreateTunnel(_) => "create_tunnel",
            ProvisionCommand::RemoveTunnel(_) => "remove_tunnel",
            ProvisionCommand::SetOperState(..) => "set_oper_state",
            ProvisionCommand::ToggleMonitoring(..) => "toggle_monitoring",
            ProvisionCommand::BindInterface(..) => "bind_interface",
            ProvisionCommand::UnbindInterface(..) => "unbind_interface",
        }
    }
}

/// The external tunnel-provisioning collaborator.
///
/// Implementations must be idempotent: the engine may repeat a command after
/// a retry or replay.
#[async_trait]
pub trait TunnelProvisioner: Send + Sync {
    async fn create_tunnel(&self, cmd: &CreateTunnel) -> ItmResult<()>;

    async fn remove_tunnel(&self, name: &TunnelName) -> ItmResult<()>;

    async fn set_oper_state(&self, name: &TunnelName, status: OperStatus) -> ItmResult<()>;

    async fn toggle_monitoring(&self, zone: &str, params: &MonitoringConfig) -> ItmResult<()>;

    /// Installs the dataplane state of an interface on `port`.
    async fn bind_interface(&self, name: &str, port: PortId) -> ItmResult<()>;

    /// Removes the dataplane state of an interface from `port`.
    async fn unbind_interface(&self, name: &str, port: PortId) -> ItmResult<()>;
}

/// Provisioner that logs and records every command.
///
/// Used by tests and by the daemon in dry-run mode.
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    commands: Mutex<Vec<ProvisionCommand>>,
    fail_next: AtomicU32,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` commands fail with a retryable error.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Returns all recorded commands in order.
    pub fn commands(&self) -> Vec<ProvisionCommand> {
        self.commands.lock().clone()
    }

    /// Drains the recorded commands.
    pub fn take(&self) -> Vec<ProvisionCommand> {
        std::mem::take(&mut *self.commands.lock())
    }

    pub fn created(&self) -> Vec<CreateTunnel> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                ProvisionCommand::CreateTunnel(cmd) => Some(cmd.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<TunnelName> {
        self.commands
            .lock()
            .iter()
            .filter_map(|c| match c {
                ProvisionCommand::RemoveTunnel(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    fn record(&self, cmd: ProvisionCommand) -> ItmResult<()> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ItmError::provisioner(cmd.name(), "injected failure"));
        }
        self.commands.lock().push(cmd);
        Ok(())
    }
}

#[async_trait]
impl TunnelProvisioner for RecordingProvisioner {
    async fn create_tunnel(&self, cmd: &CreateTunnel) -> ItmResult<()> {
        info!(
            tunnel = %cmd.name,
            src_dpn = %cmd.src_dpn,
            remote = ?cmd.remote,
            kind = %cmd.kind,
            "create tunnel"
        );
        self.record(ProvisionCommand::CreateTunnel(cmd.clone()))
    }

    async fn remove_tunnel(&self, name: &TunnelName) -> ItmResult<()> {
        info!(tunnel = %name, "remove tunnel");
        self.record(ProvisionCommand::RemoveTunnel(name.clone()))
    }

    async fn set_oper_state(&self, name: &TunnelName, status: OperStatus) -> ItmResult<()> {
        info!(tunnel = %name, %status, "set tunnel oper state");
        self.record(ProvisionCommand::SetOperState(name.clone(), status))
    }

    async fn toggle_monitoring(&self, zone: &str, params: &MonitoringConfig) -> ItmResult<()> {
        info!(
            zone,
            enabled = params.enabled,
            protocol = %params.protocol,
            interval_ms = params.interval_ms,
            "toggle monitoring"
        );
        self.record(ProvisionCommand::ToggleMonitoring(zone.to_string(), *params))
    }

    async fn bind_interface(&self, name: &str, port: PortId) -> ItmResult<()> {
        info!(interface = name, %port, "bind interface");
        self.record(ProvisionCommand::BindInterface(name.to_string(), port))
    }

    async fn unbind_interface(&self, name: &str, port: PortId) -> ItmResult<()> {
        info!(interface = name, %port, "unbind interface");
        self.record(ProvisionCommand::UnbindInterface(name.to_string(), port))
    }
}
